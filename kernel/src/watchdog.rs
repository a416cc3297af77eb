//! Watchdog timers
//!
//! The core only needs `arm`/`disarm` and a way to learn which timers fired.
//! [`DeltaChain`] is the default tick driven implementation: each entry
//! stores the ticks remaining after its predecessor fires, so a tick only
//! ever touches the head of the chain.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::thread::ThreadId;

/// Relative delay in clock ticks
pub type Interval = u32;

/// Absolute time in clock ticks since boot
pub type Ticks = u64;

/// Identity of one arming of a thread timer
///
/// The sequence number changes on every arm, so a timer that fires after
/// being disarmed and re-armed is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchdogToken {
    pub thread: ThreadId,
    pub sequence: u32,
}

/// Timer source consumed by the core
pub trait TimerSource: Send {
    /// Fire `token` after `delay` ticks
    fn arm(&mut self, token: WatchdogToken, delay: Interval);

    /// Cancel `token`; `false` if it already fired or was never armed
    fn disarm(&mut self, token: WatchdogToken) -> bool;

    /// Advance by one tick and return the timers that fired, in order
    fn tick(&mut self) -> Vec<WatchdogToken>;

    fn is_armed(&self, token: WatchdogToken) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct DeltaEntry {
    token: WatchdogToken,
    delta: Interval,
}

/// Delta-encoded timer chain
#[derive(Debug, Default)]
pub struct DeltaChain {
    chain: VecDeque<DeltaEntry>,
}

impl DeltaChain {
    pub fn new() -> Self {
        Self {
            chain: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Ticks left until `token` fires
    pub fn remaining(&self, token: WatchdogToken) -> Option<Interval> {
        let mut total: Interval = 0;
        for entry in &self.chain {
            total = total.saturating_add(entry.delta);
            if entry.token == token {
                return Some(total);
            }
        }
        None
    }
}

impl TimerSource for DeltaChain {
    fn arm(&mut self, token: WatchdogToken, delay: Interval) {
        debug_assert!(!self.is_armed(token));

        // Equal expiry times fire in arming order: stop only on a strictly
        // larger delta.
        let mut remaining = delay;
        let mut position = self.chain.len();
        for (index, entry) in self.chain.iter_mut().enumerate() {
            if remaining < entry.delta {
                entry.delta -= remaining;
                position = index;
                break;
            }
            remaining -= entry.delta;
        }

        self.chain.insert(
            position,
            DeltaEntry {
                token,
                delta: remaining,
            },
        );
    }

    fn disarm(&mut self, token: WatchdogToken) -> bool {
        let Some(position) = self.chain.iter().position(|entry| entry.token == token) else {
            return false;
        };
        let Some(removed) = self.chain.remove(position) else {
            return false;
        };
        if let Some(next) = self.chain.get_mut(position) {
            next.delta += removed.delta;
        }
        true
    }

    fn tick(&mut self) -> Vec<WatchdogToken> {
        let mut fired = Vec::new();

        match self.chain.front_mut() {
            None => return fired,
            Some(first) if first.delta > 0 => {
                first.delta -= 1;
                if first.delta > 0 {
                    return fired;
                }
            }
            Some(_) => {}
        }

        while self.chain.front().map_or(false, |entry| entry.delta == 0) {
            if let Some(entry) = self.chain.pop_front() {
                fired.push(entry.token);
            }
        }
        fired
    }

    fn is_armed(&self, token: WatchdogToken) -> bool {
        self.chain.iter().any(|entry| entry.token == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectApi, ObjectId, THREAD_CLASS};
    use proptest::prelude::*;

    fn token(index: u16) -> WatchdogToken {
        WatchdogToken {
            thread: ObjectId::build(ObjectApi::Classic, THREAD_CLASS, 1, index),
            sequence: 1,
        }
    }

    fn run_until_empty(chain: &mut DeltaChain) -> Vec<(u32, WatchdogToken)> {
        let mut fired = Vec::new();
        let mut now = 0;
        while !chain.is_empty() {
            now += 1;
            for t in chain.tick() {
                fired.push((now, t));
            }
        }
        fired
    }

    #[test]
    fn test_fires_in_expiry_order() {
        let mut chain = DeltaChain::new();
        chain.arm(token(1), 10);
        chain.arm(token(2), 3);
        chain.arm(token(3), 7);

        assert_eq!(chain.remaining(token(1)), Some(10));
        assert_eq!(
            run_until_empty(&mut chain),
            vec![(3, token(2)), (7, token(3)), (10, token(1))]
        );
    }

    #[test]
    fn test_equal_expiry_fires_in_arming_order() {
        let mut chain = DeltaChain::new();
        chain.arm(token(1), 5);
        chain.arm(token(2), 5);
        let fired = run_until_empty(&mut chain);
        assert_eq!(fired, vec![(5, token(1)), (5, token(2))]);
    }

    #[test]
    fn test_disarm_keeps_later_expiry() {
        let mut chain = DeltaChain::new();
        chain.arm(token(1), 4);
        chain.arm(token(2), 9);
        assert!(chain.disarm(token(1)));
        assert!(!chain.disarm(token(1)));
        assert_eq!(chain.remaining(token(2)), Some(9));
        assert_eq!(run_until_empty(&mut chain), vec![(9, token(2))]);
    }

    #[test]
    fn test_zero_delay_fires_on_next_tick() {
        let mut chain = DeltaChain::new();
        chain.arm(token(1), 0);
        assert_eq!(chain.tick(), vec![token(1)]);
        assert!(chain.tick().is_empty());
    }

    proptest! {
        #[test]
        fn prop_each_timer_fires_at_its_delay(delays in proptest::collection::vec(1u32..50, 1..20)) {
            let mut chain = DeltaChain::new();
            for (i, d) in delays.iter().enumerate() {
                chain.arm(token(i as u16 + 1), *d);
            }
            let fired = run_until_empty(&mut chain);
            prop_assert_eq!(fired.len(), delays.len());
            for (when, t) in fired {
                prop_assert_eq!(when, delays[t.thread.index() as usize - 1]);
            }
        }
    }
}
