//! Blocking, unblocking and timeouts
//!
//! A thread waits on at most one thread queue at a time. Three parties may
//! try to end a wait: a satisfier (`queue_dequeue`, `unblock`), the timer
//! and the life-cycle code. Whoever clears `wait.queue` first wins; the
//! others find the wait already gone and do nothing.

use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::object::ObjectId;
use crate::score::Score;
use crate::score_assert;
use crate::watchdog::{Interval, WatchdogToken};

use super::states::States;
use super::threadq::QueueId;
use super::ThreadId;

/// Outcome of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Successful,
    Timeout,
    ObjectWasDeleted,
    Unsatisfied,
}

/// Wait record of a thread
///
/// `id`, `count`, `option` and the return arguments belong to the waiting
/// primitive: it fills them before blocking and reads them afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub(crate) queue: Option<QueueId>,
    pub id: Option<ObjectId>,
    pub count: u32,
    pub option: u32,
    pub return_argument: usize,
    pub return_argument_second: usize,
    pub(crate) return_code: WaitStatus,
}

impl WaitInfo {
    pub const fn new() -> Self {
        Self {
            queue: None,
            id: None,
            count: 0,
            option: 0,
            return_argument: 0,
            return_argument_second: 0,
            return_code: WaitStatus::Successful,
        }
    }

    /// Queue the thread currently waits on
    pub fn queue(&self) -> Option<QueueId> {
        self.queue
    }

    pub fn return_code(&self) -> WaitStatus {
        self.return_code
    }
}

impl Default for WaitInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Relative timeout of a blocking operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    Ticks(Interval),
}

impl Timeout {
    /// Finite delay, `None` when the wait never times out
    pub fn ticks(self) -> Option<Interval> {
        match self {
            Self::Ticks(ticks) if ticks > 0 => Some(ticks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedTimer {
    token: WatchdogToken,
    /// Queue whose wait this timer bounds; `None` for a plain delay
    bound_queue: Option<QueueId>,
}

/// Per-thread timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerControl {
    armed: Option<ArmedTimer>,
    sequence: u32,
}

impl TimerControl {
    pub const fn new() -> Self {
        Self {
            armed: None,
            sequence: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn token(&self) -> Option<WatchdogToken> {
        self.armed.map(|armed| armed.token)
    }
}

impl Score {
    // ═══════════════════════════════════════════════════════════════
    // State transitions
    // ═══════════════════════════════════════════════════════════════

    /// Add `state` to the state set, removing a ready thread from the
    /// ready set
    pub fn set_state(&mut self, id: ThreadId, state: States) {
        let level = self.isr_disable();
        let was_ready = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            let was_ready = thread.current_state.is_ready();
            thread.current_state |= state;
            was_ready
        };
        if was_ready && !state.is_empty() {
            self.block_scheduler(id);
        }
        self.isr_enable(level);
    }

    /// Remove `state` from the state set; a thread left with no state is
    /// handed to the scheduler. Returns `true` if the thread became ready.
    pub fn clear_state(&mut self, id: ThreadId, state: States) -> bool {
        let level = self.isr_disable();
        let became_ready = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            if thread.current_state.intersects(state) {
                thread.current_state.remove(state);
                thread.current_state.is_ready()
            } else {
                false
            }
        };
        if became_ready {
            self.unblock_scheduler(id);
        }
        self.isr_enable(level);
        became_ready
    }

    pub fn suspend(&mut self, id: ThreadId) -> ScoreResult<()> {
        let state = self.thread_or_err(id)?.current_state;
        if state.is_suspended() || state.is_zombie() || state.is_dormant() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        self.set_state(id, States::SUSPENDED);
        Ok(())
    }

    pub fn resume(&mut self, id: ThreadId) -> ScoreResult<()> {
        let state = self.thread_or_err(id)?.current_state;
        if !state.is_suspended() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        self.clear_state(id, States::SUSPENDED);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Blocking
    // ═══════════════════════════════════════════════════════════════

    /// Block a ready thread on `queue`, optionally with a timeout
    ///
    /// The thread enters the queue's blocking state and its wait status is
    /// reset to `Successful`. The caller-owned fields of the wait record
    /// are left untouched.
    pub fn block(&mut self, id: ThreadId, queue: QueueId, timeout: Timeout) {
        let level = self.isr_disable();
        let blocking_state = {
            let Some(thread_queue) = self.queues.get_mut(queue) else {
                fatal(InternalError::BlockWithoutQueue)
            };
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            score_assert!(
                thread.current_state.is_ready(),
                InternalError::BlockNonReadyThread
            );
            thread.wait.queue = Some(queue);
            thread.wait.return_code = WaitStatus::Successful;
            thread_queue.insert(id, thread.current_priority);
            thread_queue.state()
        };

        if let Some(ticks) = timeout.ticks() {
            self.arm_timer(id, Some(queue), ticks);
        }
        self.set_state(id, blocking_state);
        self.isr_enable(level);

        log::trace!("[WAIT] {} blocked on {:?} ({:?})", id, queue, timeout);
    }

    /// End the wait of a blocked thread
    ///
    /// Disarms the timer, leaves the thread queue and clears the blocking
    /// states. The wait status is not changed. Returns `false` when there
    /// was nothing to end.
    pub fn unblock(&mut self, id: ThreadId) -> bool {
        let level = self.isr_disable();
        let queue = match self.threads.get_mut(id) {
            Some(thread) if thread.current_state.is_blocked() => Some(thread.wait.queue.take()),
            _ => None,
        };
        let Some(queue) = queue else {
            self.isr_enable(level);
            return false;
        };
        if let Some(queue) = queue.and_then(|queue| self.queues.get_mut(queue)) {
            queue.remove(id);
        }
        self.disarm_timer(id);
        self.clear_state(id, States::BLOCKED);
        self.isr_enable(level);
        true
    }

    /// Delay a ready thread for `ticks` clock ticks
    ///
    /// A zero delay yields the processor instead.
    pub fn delay(&mut self, id: ThreadId, ticks: Interval) -> ScoreResult<()> {
        let state = self.thread_or_err(id)?.current_state;
        if !state.is_ready() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        if ticks == 0 {
            self.yield_thread(id);
            return Ok(());
        }
        let level = self.isr_disable();
        self.arm_timer(id, None, ticks);
        self.set_state(id, States::DELAYING);
        self.isr_enable(level);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Timeouts
    // ═══════════════════════════════════════════════════════════════

    /// Timer expiry for `id`
    ///
    /// If the thread still waits on the queue its timer was armed for, it
    /// leaves that queue with the queue's timeout status. A delay simply
    /// ends. In every other case the wait was already satisfied and the
    /// expiry is ignored. Returns `true` if the thread was released.
    pub fn timeout_expired(&mut self, id: ThreadId) -> bool {
        let level = self.isr_disable();
        let armed = match self.threads.get_mut(id) {
            Some(thread) => thread.timer.armed.take(),
            None => None,
        };
        let Some(armed) = armed else {
            self.isr_enable(level);
            return false;
        };
        self.timers.disarm(armed.token);

        let released = match armed.bound_queue {
            Some(bound) => self.expire_queue_wait(id, bound),
            None => {
                let delaying = self
                    .threads
                    .get(id)
                    .map_or(false, |thread| thread.current_state.is_delaying());
                if delaying {
                    self.clear_state(id, States::DELAYING | States::WAITING_FOR_TIME);
                }
                delaying
            }
        };
        self.isr_enable(level);
        released
    }

    fn expire_queue_wait(&mut self, id: ThreadId, bound: QueueId) -> bool {
        let still_waiting = self
            .threads
            .get(id)
            .map_or(false, |thread| thread.wait.queue == Some(bound));
        if !still_waiting {
            return false;
        }
        let status = match self.queues.get_mut(bound) {
            Some(queue) => {
                queue.remove(id);
                queue.timeout_status()
            }
            None => WaitStatus::Timeout,
        };
        if let Some(thread) = self.threads.get_mut(id) {
            thread.wait.queue = None;
            thread.wait.return_code = status;
        }
        self.stats.timeouts += 1;
        self.clear_state(id, States::BLOCKED);
        log::debug!("[WAIT] {} timed out on {:?}", id, bound);
        true
    }

    /// Dispatch a fired watchdog; stale tokens are dropped
    pub(crate) fn timer_fired(&mut self, token: WatchdogToken) {
        let current = self
            .threads
            .get(token.thread)
            .and_then(|thread| thread.timer.token());
        if current == Some(token) {
            self.timeout_expired(token.thread);
        }
    }

    pub(crate) fn arm_timer(&mut self, id: ThreadId, bound_queue: Option<QueueId>, ticks: Interval) {
        self.disarm_timer(id);
        let Some(thread) = self.threads.get_mut(id) else {
            fatal(InternalError::UnknownThread)
        };
        thread.timer.sequence = thread.timer.sequence.wrapping_add(1);
        let token = WatchdogToken {
            thread: id,
            sequence: thread.timer.sequence,
        };
        thread.timer.armed = Some(ArmedTimer { token, bound_queue });
        self.timers.arm(token, ticks);
    }

    pub(crate) fn disarm_timer(&mut self, id: ThreadId) -> bool {
        let armed = self
            .threads
            .get_mut(id)
            .and_then(|thread| thread.timer.armed.take());
        match armed {
            Some(armed) => self.timers.disarm(armed.token),
            None => false,
        }
    }

    /// Drop any wait without touching the state set or the wait status
    pub(crate) fn abort_wait(&mut self, id: ThreadId) {
        let queue = self
            .threads
            .get_mut(id)
            .and_then(|thread| thread.wait.queue.take());
        if let Some(queue) = queue.and_then(|queue| self.queues.get_mut(queue)) {
            queue.remove(id);
        }
        self.disarm_timer(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreConfig;
    use crate::scheduler::edf::deadline;
    use crate::thread::threadq::QueueDiscipline;
    use crate::thread::{EntryArgument, ThreadAttributes, ThreadEntry};

    fn score_with_thread() -> (Score, ThreadId, QueueId) {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let id = score
            .thread_create(&ThreadAttributes::new("T", deadline(100)))
            .unwrap();
        score
            .thread_start(id, ThreadEntry::new(0x1000, EntryArgument::Numeric(0)))
            .unwrap();
        let queue = score.queue_create(
            QueueDiscipline::Fifo,
            States::WAITING_FOR_SEMAPHORE,
            WaitStatus::Timeout,
        );
        (score, id, queue)
    }

    #[test]
    fn test_block_then_unblock_restores_ready() {
        let (mut score, id, queue) = score_with_thread();
        let ready_before = score.scheduler().ready_count();

        score.block(id, queue, Timeout::Forever);
        let thread = score.thread(id).unwrap();
        assert!(thread.state().contains(States::WAITING_FOR_SEMAPHORE));
        assert_eq!(thread.wait().queue(), Some(queue));
        assert_eq!(score.scheduler().ready_count(), ready_before - 1);

        assert!(score.unblock(id));
        let thread = score.thread(id).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.wait().queue(), None);
        assert_eq!(thread.wait().return_code(), WaitStatus::Successful);
        assert_eq!(score.scheduler().ready_count(), ready_before);
        assert!(score.queue(queue).unwrap().is_empty());
    }

    #[test]
    fn test_unblock_of_ready_thread_is_noop() {
        let (mut score, id, _) = score_with_thread();
        assert!(!score.unblock(id));
        assert!(score.thread(id).unwrap().is_ready());
    }

    #[test]
    fn test_timeout_sets_queue_status() {
        let (mut score, id, queue) = score_with_thread();
        score.block(id, queue, Timeout::Ticks(5));
        for _ in 0..4 {
            score.clock_tick();
        }
        assert!(!score.thread(id).unwrap().is_ready());

        score.clock_tick();
        let thread = score.thread(id).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.wait().return_code(), WaitStatus::Timeout);
        assert!(score.queue(queue).unwrap().is_empty());
        assert_eq!(score.stats().timeouts, 1);
    }

    #[test]
    fn test_satisfy_before_timeout_wins() {
        let (mut score, id, queue) = score_with_thread();
        score.block(id, queue, Timeout::Ticks(5));
        assert_eq!(score.queue_dequeue(queue), Some(id));
        assert!(!score.thread(id).unwrap().timer().is_armed());

        for _ in 0..10 {
            score.clock_tick();
        }
        let thread = score.thread(id).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.wait().return_code(), WaitStatus::Successful);
        assert_eq!(score.stats().timeouts, 0);
    }

    #[test]
    fn test_unblock_after_timeout_is_noop() {
        let (mut score, id, queue) = score_with_thread();
        let ready_before = score.scheduler().ready_count();
        score.block(id, queue, Timeout::Ticks(3));
        for _ in 0..3 {
            score.clock_tick();
        }
        assert!(score.thread(id).unwrap().is_ready());
        assert_eq!(score.scheduler().ready_count(), ready_before);

        assert!(!score.unblock(id));
        let thread = score.thread(id).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.wait().return_code(), WaitStatus::Timeout);
        assert_eq!(score.scheduler().ready_count(), ready_before);
        assert_eq!(score.stats().timeouts, 1);
    }

    #[test]
    fn test_unblock_before_timeout_disarms_timer() {
        let (mut score, id, queue) = score_with_thread();
        let ready_before = score.scheduler().ready_count();
        score.block(id, queue, Timeout::Ticks(5));
        let token = score.thread(id).unwrap().timer().token().unwrap();
        assert!(score.timers.is_armed(token));

        assert!(score.unblock(id));
        assert!(!score.thread(id).unwrap().timer().is_armed());
        assert!(!score.timers.is_armed(token));
        assert!(score.queue(queue).unwrap().is_empty());

        for _ in 0..10 {
            score.clock_tick();
        }
        let thread = score.thread(id).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.wait().return_code(), WaitStatus::Successful);
        assert_eq!(score.scheduler().ready_count(), ready_before);
        assert_eq!(score.stats().timeouts, 0);
    }

    #[test]
    fn test_late_expiry_after_rebind_is_ignored() {
        let (mut score, id, queue) = score_with_thread();
        let other = score.queue_create(
            QueueDiscipline::Fifo,
            States::WAITING_FOR_MUTEX,
            WaitStatus::Timeout,
        );
        score.block(id, queue, Timeout::Ticks(5));
        assert_eq!(score.queue_dequeue(queue), Some(id));
        score.block(id, other, Timeout::Forever);

        // The first timer is gone; a forced expiry finds nothing armed
        assert!(!score.timeout_expired(id));
        let thread = score.thread(id).unwrap();
        assert_eq!(thread.wait().queue(), Some(other));
        assert!(thread.state().contains(States::WAITING_FOR_MUTEX));
    }

    #[test]
    fn test_delay_wakes_after_ticks() {
        let (mut score, id, _) = score_with_thread();
        score.delay(id, 3).unwrap();
        assert!(score.thread(id).unwrap().state().is_delaying());
        score.clock_tick();
        score.clock_tick();
        assert!(!score.thread(id).unwrap().is_ready());
        score.clock_tick();
        assert!(score.thread(id).unwrap().is_ready());
        assert_eq!(score.stats().timeouts, 0);
    }

    #[test]
    fn test_suspend_while_blocked_needs_both_cleared() {
        let (mut score, id, queue) = score_with_thread();
        score.block(id, queue, Timeout::Forever);
        score.suspend(id).unwrap();
        assert!(score.unblock(id));
        assert!(!score.thread(id).unwrap().is_ready());
        score.resume(id).unwrap();
        assert!(score.thread(id).unwrap().is_ready());
    }

    #[test]
    fn test_resume_of_running_thread_fails() {
        let (mut score, id, _) = score_with_thread();
        assert!(matches!(
            score.resume(id),
            Err(ScoreError::IncorrectState { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "BlockNonReadyThread")]
    fn test_block_of_blocked_thread_is_fatal() {
        let (mut score, id, queue) = score_with_thread();
        score.block(id, queue, Timeout::Forever);
        score.block(id, queue, Timeout::Forever);
    }
}
