//! Thread state set
//!
//! A thread is ready exactly when its state set is empty. Every other bit
//! names one reason the thread may not run; several may be set at once
//! (a suspended thread can also be waiting on a semaphore).

use bitflags::bitflags;
use core::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct States: u32 {
        /// Created but never started
        const DORMANT                        = 0x0000_0001;
        const SUSPENDED                      = 0x0000_0002;
        const TRANSIENT                      = 0x0000_0004;
        const DELAYING                       = 0x0000_0008;
        const WAITING_FOR_TIME               = 0x0000_0010;
        const WAITING_FOR_BUFFER             = 0x0000_0020;
        const WAITING_FOR_SEGMENT            = 0x0000_0040;
        const WAITING_FOR_MESSAGE            = 0x0000_0080;
        const WAITING_FOR_EVENT              = 0x0000_0100;
        const WAITING_FOR_SEMAPHORE          = 0x0000_0200;
        const WAITING_FOR_MUTEX              = 0x0000_0400;
        const WAITING_FOR_CONDITION_VARIABLE = 0x0000_0800;
        const WAITING_FOR_JOIN               = 0x0000_1000;
        const WAITING_FOR_PERIOD             = 0x0000_4000;
        const WAITING_FOR_SIGNAL             = 0x0000_8000;
        const WAITING_FOR_BARRIER            = 0x0001_0000;
        const WAITING_FOR_RWLOCK             = 0x0002_0000;
        /// Waiting until another thread has terminated
        const WAITING_FOR_TERMINATION        = 0x0010_0000;
        /// Terminated, control block not yet freed
        const ZOMBIE                         = 0x0020_0000;
        const INTERRUPTIBLE_BY_SIGNAL        = 0x1000_0000;
    }
}

impl States {
    pub const READY: Self = Self::empty();

    /// States that put a thread on a thread queue
    pub const WAITING_ON_THREAD_QUEUE: Self = Self::from_bits_retain(
        Self::WAITING_FOR_BUFFER.bits()
            | Self::WAITING_FOR_SEGMENT.bits()
            | Self::WAITING_FOR_MESSAGE.bits()
            | Self::WAITING_FOR_SEMAPHORE.bits()
            | Self::WAITING_FOR_MUTEX.bits()
            | Self::WAITING_FOR_CONDITION_VARIABLE.bits()
            | Self::WAITING_FOR_JOIN.bits()
            | Self::WAITING_FOR_SIGNAL.bits()
            | Self::WAITING_FOR_BARRIER.bits()
            | Self::WAITING_FOR_RWLOCK.bits(),
    );

    /// States removed by unblocking a thread
    pub const BLOCKED: Self = Self::from_bits_retain(
        Self::WAITING_ON_THREAD_QUEUE.bits()
            | Self::DELAYING.bits()
            | Self::TRANSIENT.bits()
            | Self::WAITING_FOR_TIME.bits()
            | Self::WAITING_FOR_PERIOD.bits()
            | Self::WAITING_FOR_EVENT.bits()
            | Self::WAITING_FOR_TERMINATION.bits()
            | Self::INTERRUPTIBLE_BY_SIGNAL.bits(),
    );

    #[inline]
    pub fn is_ready(self) -> bool {
        self.is_empty()
    }

    #[inline]
    pub fn is_blocked(self) -> bool {
        self.intersects(Self::BLOCKED)
    }

    #[inline]
    pub fn is_waiting_on_thread_queue(self) -> bool {
        self.intersects(Self::WAITING_ON_THREAD_QUEUE)
    }

    #[inline]
    pub fn is_dormant(self) -> bool {
        self.contains(Self::DORMANT)
    }

    #[inline]
    pub fn is_suspended(self) -> bool {
        self.contains(Self::SUSPENDED)
    }

    #[inline]
    pub fn is_zombie(self) -> bool {
        self.contains(Self::ZOMBIE)
    }

    #[inline]
    pub fn is_delaying(self) -> bool {
        self.intersects(Self::DELAYING | Self::WAITING_FOR_TIME)
    }
}

impl fmt::Display for States {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            return write!(f, "READY");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_eq_size!(States, u32);

    #[test]
    fn test_ready_is_empty() {
        assert!(States::READY.is_ready());
        assert!(!States::DORMANT.is_ready());
        assert!(!States::READY.is_blocked());
    }

    #[test]
    fn test_suspension_is_not_a_block() {
        let state = States::SUSPENDED | States::WAITING_FOR_SEMAPHORE;
        assert!(state.is_blocked());
        assert!(state.is_suspended());
        assert!(!States::SUSPENDED.is_blocked());
        assert!(!States::ZOMBIE.is_blocked());
    }

    #[test]
    fn test_display_lists_flags() {
        assert_eq!(alloc::format!("{}", States::READY), "READY");
        assert_eq!(
            alloc::format!("{}", States::DORMANT | States::SUSPENDED),
            "DORMANT|SUSPENDED"
        );
    }
}
