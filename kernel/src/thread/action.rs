//! Post-switch thread actions
//!
//! Work queued for a thread and run on its own behalf right after it has
//! been switched in. The chain is guarded by the thread action lock, here
//! the interrupt level of the current processor. Handlers are entered with
//! the lock held and must give it back through [`ActionGuard::release`]
//! before doing anything that may block or re-enter the scheduler.

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{fatal, InternalError};
use crate::percpu::{CpuIndex, IsrLevel};
use crate::score::Score;
use crate::score_assert;

use super::ThreadId;

/// Action handler, called with the action lock held
pub type ThreadActionHandler = fn(&mut Score, ThreadId, ThreadAction, ActionGuard) -> ActionReleased;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionKey(u32);

static NEXT_ACTION_KEY: AtomicU32 = AtomicU32::new(1);

/// A handler plus the identity used to detect double registration
#[derive(Clone, Copy)]
pub struct ThreadAction {
    key: ActionKey,
    handler: ThreadActionHandler,
}

impl ThreadAction {
    pub fn initialize(handler: ThreadActionHandler) -> Self {
        Self {
            key: ActionKey(NEXT_ACTION_KEY.fetch_add(1, Ordering::Relaxed)),
            handler,
        }
    }

    pub fn key(&self) -> ActionKey {
        self.key
    }
}

impl fmt::Debug for ThreadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadAction").field("key", &self.key).finish()
    }
}

/// Pending post-switch actions of one thread, in registration order
#[derive(Debug, Default)]
pub struct ActionControl {
    chain: VecDeque<ThreadAction>,
}

impl ActionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn contains(&self, key: ActionKey) -> bool {
        self.chain.iter().any(|action| action.key == key)
    }

    /// Append unless already pending
    pub(crate) fn add(&mut self, action: ThreadAction) -> bool {
        if self.contains(action.key) {
            return false;
        }
        self.chain.push_back(action);
        true
    }

    pub(crate) fn take_first(&mut self) -> Option<ThreadAction> {
        self.chain.pop_front()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.chain.len();
        self.chain.clear();
        dropped
    }
}

/// Thread action lock held by a running handler
#[must_use = "the action lock must be released by the handler"]
#[derive(Debug)]
pub struct ActionGuard {
    cpu: CpuIndex,
    level: IsrLevel,
}

/// Proof that a handler released its [`ActionGuard`]
#[derive(Debug)]
pub struct ActionReleased(());

impl ActionGuard {
    pub fn cpu(&self) -> CpuIndex {
        self.cpu
    }

    pub fn release(self, score: &mut Score) -> ActionReleased {
        score.isr_enable_on(self.cpu, self.level);
        ActionReleased(())
    }
}

impl Score {
    /// Queue `action` for `id`; the caller must have interrupts disabled
    ///
    /// Adding an action that is already pending does nothing and returns
    /// `false`.
    pub fn add_post_switch_action(&mut self, id: ThreadId, action: ThreadAction) -> bool {
        score_assert!(
            self.interrupts_disabled(),
            InternalError::ActionAddWithInterruptsEnabled
        );
        let Some(thread) = self.threads.get_mut(id) else {
            fatal(InternalError::UnknownThread)
        };
        let added = thread.post_switch_actions.add(action);
        if added {
            log::trace!("[ACTION] {:?} queued for {}", action.key, id);
        }
        added
    }

    fn action_acquire(&mut self) -> ActionGuard {
        let cpu = self.current;
        let level = self.isr_disable();
        ActionGuard { cpu, level }
    }

    /// Run the pending actions of `id` until the chain is empty
    ///
    /// Actions added by a handler run in the same pass. Once the thread
    /// has become a zombie its remaining actions are discarded.
    pub fn run_post_switch(&mut self, id: ThreadId) {
        let mut guard = self.action_acquire();
        loop {
            let next = match self.threads.get_mut(id) {
                Some(thread) if thread.current_state.is_zombie() => {
                    let dropped = thread.post_switch_actions.clear();
                    if dropped > 0 {
                        log::debug!("[ACTION] zombie {} dropped {} actions", id, dropped);
                    }
                    None
                }
                Some(thread) => thread.post_switch_actions.take_first(),
                None => None,
            };
            let Some(action) = next else { break };

            self.stats.post_switch_actions += 1;
            let ActionReleased(()) = (action.handler)(self, id, action, guard);
            guard = self.action_acquire();
        }
        let ActionReleased(()) = guard.release(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreConfig;
    use crate::scheduler::edf::deadline;
    use crate::thread::{EntryArgument, ThreadAttributes, ThreadEntry};
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    fn score_with_thread() -> (Score, ThreadId) {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let id = score
            .thread_create(&ThreadAttributes::new("T", deadline(10)))
            .unwrap();
        score
            .thread_start(id, ThreadEntry::new(0x3000, EntryArgument::Numeric(0)))
            .unwrap();
        (score, id)
    }

    static COUNTING_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler(
        score: &mut Score,
        _id: ThreadId,
        _action: ThreadAction,
        guard: ActionGuard,
    ) -> ActionReleased {
        COUNTING_RUNS.fetch_add(1, Ordering::SeqCst);
        guard.release(score)
    }

    #[test]
    fn test_action_runs_once_after_dispatch() {
        let (mut score, id) = score_with_thread();
        let action = ThreadAction::initialize(counting_handler);

        let level = score.isr_disable();
        assert!(score.add_post_switch_action(id, action));
        assert!(!score.add_post_switch_action(id, action));
        score.isr_enable(level);
        assert_eq!(score.thread(id).unwrap().post_switch_actions().len(), 1);

        let before = COUNTING_RUNS.load(Ordering::SeqCst);
        assert_eq!(score.dispatch(0), Some(id));
        assert_eq!(COUNTING_RUNS.load(Ordering::SeqCst), before + 1);
        assert!(score.thread(id).unwrap().post_switch_actions().is_empty());
        assert!(!score.interrupts_disabled());

        score.dispatch(0);
        assert_eq!(COUNTING_RUNS.load(Ordering::SeqCst), before + 1);
    }

    static CHAINED_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn chained_second(
        score: &mut Score,
        _id: ThreadId,
        _action: ThreadAction,
        guard: ActionGuard,
    ) -> ActionReleased {
        CHAINED_RUNS.fetch_add(10, Ordering::SeqCst);
        guard.release(score)
    }

    fn chained_first(
        score: &mut Score,
        id: ThreadId,
        _action: ThreadAction,
        guard: ActionGuard,
    ) -> ActionReleased {
        CHAINED_RUNS.fetch_add(1, Ordering::SeqCst);
        // Still holding the lock, so adding is allowed
        score.add_post_switch_action(id, ThreadAction::initialize(chained_second));
        guard.release(score)
    }

    #[test]
    fn test_action_added_by_handler_runs_in_same_pass() {
        let (mut score, id) = score_with_thread();
        let level = score.isr_disable();
        score.add_post_switch_action(id, ThreadAction::initialize(chained_first));
        score.isr_enable(level);

        score.run_post_switch(id);
        assert_eq!(CHAINED_RUNS.load(Ordering::SeqCst), 11);
        assert_eq!(score.stats().post_switch_actions, 2);
    }

    static FIFO_TRACE: spin::Mutex<Vec<u8>> = spin::Mutex::new(Vec::new());

    fn trace_a(score: &mut Score, _id: ThreadId, _action: ThreadAction, guard: ActionGuard) -> ActionReleased {
        FIFO_TRACE.lock().push(b'a');
        guard.release(score)
    }

    fn trace_b(score: &mut Score, _id: ThreadId, _action: ThreadAction, guard: ActionGuard) -> ActionReleased {
        FIFO_TRACE.lock().push(b'b');
        guard.release(score)
    }

    fn trace_c(score: &mut Score, _id: ThreadId, _action: ThreadAction, guard: ActionGuard) -> ActionReleased {
        FIFO_TRACE.lock().push(b'c');
        guard.release(score)
    }

    #[test]
    fn test_actions_run_in_registration_order() {
        let (mut score, id) = score_with_thread();
        let level = score.isr_disable();
        for handler in [trace_c as ThreadActionHandler, trace_a, trace_b] {
            assert!(score.add_post_switch_action(id, ThreadAction::initialize(handler)));
        }
        score.isr_enable(level);
        assert_eq!(score.thread(id).unwrap().post_switch_actions().len(), 3);

        assert_eq!(score.dispatch(0), Some(id));
        assert_eq!(FIFO_TRACE.lock().as_slice(), b"cab");
        assert!(score.thread(id).unwrap().post_switch_actions().is_empty());
        assert_eq!(score.stats().post_switch_actions, 3);
    }

    #[test]
    #[should_panic(expected = "ActionAddWithInterruptsEnabled")]
    fn test_add_with_interrupts_enabled_is_fatal() {
        let (mut score, id) = score_with_thread();
        score.add_post_switch_action(id, ThreadAction::initialize(counting_handler));
    }
}
