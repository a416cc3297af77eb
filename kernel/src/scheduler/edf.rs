//! Earliest Deadline First scheduler
//!
//! Ready threads are kept in a map ordered by (priority, sequence). A
//! deadline priority is the absolute deadline in ticks with the top bit
//! clear; background priorities have the top bit set and so always rank
//! behind every deadline. Sequence numbers grow from the middle of the
//! range for normal enqueues and shrink from it for prepends, which gives
//! FIFO order among equal priorities and lets a prepended thread go first.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::score_assert;
use crate::thread::{Thread, ThreadId};
use crate::watchdog::{Interval, Ticks};

use super::{Priority, SchedulerInfo, SchedulerPolicy};

/// Set on background priorities
pub const EDF_PRIO_MSB: Priority = 1 << 63;

/// Least urgent background level
pub const PRIORITY_MAXIMUM: Priority = 255;

/// Background priority for a classic priority level
pub const fn background(level: Priority) -> Priority {
    EDF_PRIO_MSB | level
}

/// Deadline priority for an absolute deadline
pub const fn deadline(absolute: Ticks) -> Priority {
    absolute & !EDF_PRIO_MSB
}

pub const fn is_background(priority: Priority) -> bool {
    priority & EDF_PRIO_MSB != 0
}

/// Where a thread stands with respect to the ready set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdfQueueState {
    NeverQueued,
    Ready,
    /// Queued before, not ready now
    NotQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EdfKey {
    priority: Priority,
    sequence: u64,
}

/// EDF payload of a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdfNode {
    queue_state: EdfQueueState,
    key: Option<EdfKey>,
}

impl EdfNode {
    fn new() -> Self {
        Self {
            queue_state: EdfQueueState::NeverQueued,
            key: None,
        }
    }

    pub fn queue_state(&self) -> EdfQueueState {
        self.queue_state
    }
}

const SEQUENCE_ORIGIN: u64 = 1 << 63;

pub struct EdfScheduler {
    ready: BTreeMap<EdfKey, ThreadId>,
    next_back: u64,
    next_front: u64,
    capacity: usize,
    allocated: usize,
}

impl EdfScheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: BTreeMap::new(),
            next_back: SEQUENCE_ORIGIN,
            next_front: SEQUENCE_ORIGIN - 1,
            capacity,
            allocated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Most urgent ready thread
    pub fn highest_ready(&self) -> Option<ThreadId> {
        self.ready.values().next().copied()
    }

    /// Ready threads, most urgent first
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.values().copied()
    }

    fn node_mut(thread: &mut Thread) -> &mut EdfNode {
        match &mut thread.scheduler_info {
            SchedulerInfo::Edf(node) => node,
            SchedulerInfo::Unallocated => fatal(InternalError::SchedulerPayloadMissing),
        }
    }

    fn insert(&mut self, thread: &mut Thread, first: bool) {
        let id = thread.id();
        let priority = thread.current_priority;
        let sequence = if first {
            let sequence = self.next_front;
            self.next_front -= 1;
            sequence
        } else {
            let sequence = self.next_back;
            self.next_back += 1;
            sequence
        };

        let node = Self::node_mut(thread);
        if let Some(stale) = node.key.take() {
            self.ready.remove(&stale);
        }
        let key = EdfKey { priority, sequence };
        node.key = Some(key);
        node.queue_state = EdfQueueState::Ready;
        self.ready.insert(key, id);
    }
}

impl SchedulerPolicy for EdfScheduler {
    fn name(&self) -> &'static str {
        "EDF"
    }

    fn allocate(&mut self, thread: &mut Thread) -> ScoreResult<()> {
        score_assert!(
            !thread.scheduler_info.is_allocated(),
            InternalError::SchedulerPayloadAllocatedTwice
        );
        if self.allocated >= self.capacity {
            return Err(ScoreError::SchedulerPoolExhausted {
                capacity: self.capacity,
            });
        }
        thread.scheduler_info = SchedulerInfo::Edf(EdfNode::new());
        self.allocated += 1;
        Ok(())
    }

    fn free(&mut self, thread: &mut Thread) {
        if let SchedulerInfo::Edf(node) = &thread.scheduler_info {
            if let Some(key) = node.key {
                self.ready.remove(&key);
            }
            self.allocated -= 1;
        }
        thread.scheduler_info = SchedulerInfo::Unallocated;
    }

    fn enqueue(&mut self, thread: &mut Thread) {
        self.insert(thread, false);
    }

    fn enqueue_first(&mut self, thread: &mut Thread) {
        self.insert(thread, true);
    }

    fn dequeue(&mut self, thread: &mut Thread) -> bool {
        let node = Self::node_mut(thread);
        match node.key.take() {
            Some(key) => {
                self.ready.remove(&key);
                node.queue_state = EdfQueueState::NotQueued;
                true
            }
            None => false,
        }
    }

    fn is_queued(&self, thread: &Thread) -> bool {
        matches!(&thread.scheduler_info, SchedulerInfo::Edf(node) if node.key.is_some())
    }

    fn schedule(&self, processor_count: usize) -> Vec<ThreadId> {
        self.ready.values().take(processor_count).copied().collect()
    }

    fn ready_count(&self) -> usize {
        self.ready.len()
    }

    fn priority_compare(&self, left: Priority, right: Priority) -> Ordering {
        left.cmp(&right)
    }

    fn release_job(&self, thread: &Thread, deadline: Interval, now: Ticks) -> Priority {
        if deadline == 0 {
            thread.start.initial_priority
        } else {
            self::deadline(now.wrapping_add(Ticks::from(deadline)))
        }
    }

    fn idle_priority(&self) -> Priority {
        background(PRIORITY_MAXIMUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::tests::thread_id;
    use crate::thread::ThreadAttributes;
    use proptest::prelude::*;

    fn thread(index: u16, priority: Priority) -> Thread {
        Thread::new(thread_id(index), &ThreadAttributes::new("T", priority), 10)
    }

    fn allocated(scheduler: &mut EdfScheduler, index: u16, priority: Priority) -> Thread {
        let mut thread = thread(index, priority);
        scheduler.allocate(&mut thread).unwrap();
        thread
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut scheduler = EdfScheduler::new(8);
        let mut t1 = allocated(&mut scheduler, 1, deadline(100));
        let mut t2 = allocated(&mut scheduler, 2, deadline(50));
        let mut t3 = allocated(&mut scheduler, 3, deadline(200));
        for thread in [&mut t1, &mut t2, &mut t3] {
            scheduler.enqueue(thread);
        }
        assert_eq!(scheduler.highest_ready(), Some(t2.id()));

        assert!(scheduler.dequeue(&mut t2));
        assert!(!scheduler.dequeue(&mut t2));
        assert_eq!(scheduler.highest_ready(), Some(t1.id()));
        assert_eq!(scheduler.schedule(2), [t1.id(), t3.id()]);
    }

    #[test]
    fn test_background_runs_after_deadlines() {
        let mut scheduler = EdfScheduler::new(8);
        let mut bg = allocated(&mut scheduler, 1, background(0));
        let mut late = allocated(&mut scheduler, 2, deadline(u32::MAX as u64));
        scheduler.enqueue(&mut bg);
        scheduler.enqueue(&mut late);
        assert_eq!(scheduler.highest_ready(), Some(late.id()));
        assert!(is_background(scheduler.idle_priority()));
    }

    #[test]
    fn test_enqueue_first_goes_ahead_of_equals() {
        let mut scheduler = EdfScheduler::new(8);
        let mut a = allocated(&mut scheduler, 1, deadline(10));
        let mut b = allocated(&mut scheduler, 2, deadline(10));
        scheduler.enqueue(&mut a);
        scheduler.enqueue(&mut b);
        assert_eq!(scheduler.highest_ready(), Some(a.id()));

        scheduler.dequeue(&mut b);
        scheduler.enqueue_first(&mut b);
        assert_eq!(scheduler.highest_ready(), Some(b.id()));
    }

    #[test]
    fn test_queue_state_transitions() {
        let mut scheduler = EdfScheduler::new(1);
        let mut t = allocated(&mut scheduler, 1, deadline(10));
        let state = |t: &Thread| match t.scheduler_info() {
            SchedulerInfo::Edf(node) => node.queue_state(),
            SchedulerInfo::Unallocated => panic!("no payload"),
        };
        assert_eq!(state(&t), EdfQueueState::NeverQueued);
        scheduler.enqueue(&mut t);
        assert_eq!(state(&t), EdfQueueState::Ready);
        assert!(scheduler.is_queued(&t));
        scheduler.dequeue(&mut t);
        assert_eq!(state(&t), EdfQueueState::NotQueued);

        scheduler.enqueue(&mut t);
        scheduler.free(&mut t);
        assert_eq!(scheduler.ready_count(), 0);
        assert_eq!(scheduler.allocated(), 0);
        assert!(!t.scheduler_info().is_allocated());
    }

    #[test]
    fn test_payload_pool_exhaustion() {
        let mut scheduler = EdfScheduler::new(1);
        let _t = allocated(&mut scheduler, 1, deadline(10));
        let mut other = thread(2, deadline(10));
        assert_eq!(
            scheduler.allocate(&mut other),
            Err(ScoreError::SchedulerPoolExhausted { capacity: 1 })
        );
    }

    #[test]
    fn test_release_job_clears_msb() {
        let scheduler = EdfScheduler::new(1);
        let t = thread(1, background(3));
        assert_eq!(scheduler.release_job(&t, 5, u64::MAX - 1), deadline(3));
        assert_eq!(scheduler.release_job(&t, 0, 1000), background(3));
    }

    proptest! {
        #[test]
        fn prop_order_is_priority_then_fifo(
            priorities in proptest::collection::vec(0u64..16, 1..40),
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            let mut scheduler = EdfScheduler::new(priorities.len());
            let mut threads: Vec<Thread> = priorities
                .iter()
                .enumerate()
                .map(|(i, &p)| allocated(&mut scheduler, i as u16 + 1, deadline(p)))
                .collect();
            for thread in threads.iter_mut() {
                scheduler.enqueue(thread);
            }

            let mut model: Vec<(Priority, usize)> =
                priorities.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
            for index in removals {
                if model.is_empty() {
                    break;
                }
                let (_, victim) = model.remove(index.index(model.len()));
                prop_assert!(scheduler.dequeue(&mut threads[victim]));
            }
            model.sort();

            let expected: Vec<ThreadId> = model.iter().map(|&(_, i)| threads[i].id()).collect();
            prop_assert_eq!(scheduler.schedule(usize::MAX), expected);
            prop_assert_eq!(scheduler.ready_count(), model.len());
        }
    }
}
