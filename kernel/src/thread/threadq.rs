//! Thread queues
//!
//! The waiting side of every blocking primitive. A queue orders its
//! waiters FIFO or by priority and knows which state its waiters block in
//! and which status they get when their timeout expires.

use alloc::collections::{BTreeMap, VecDeque};

use crate::error::{fatal, InternalError};
use crate::scheduler::Priority;
use crate::score::Score;
use crate::score_assert;

use super::states::States;
use super::wait::WaitStatus;
use super::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    Fifo,
    /// Most urgent first, FIFO among equals
    Priority,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    thread: ThreadId,
    priority: Priority,
}

#[derive(Debug)]
pub struct ThreadQueue {
    discipline: QueueDiscipline,
    state: States,
    timeout_status: WaitStatus,
    waiters: VecDeque<Waiter>,
}

impl ThreadQueue {
    pub fn new(discipline: QueueDiscipline, state: States, timeout_status: WaitStatus) -> Self {
        Self {
            discipline,
            state,
            timeout_status,
            waiters: VecDeque::new(),
        }
    }

    pub fn discipline(&self) -> QueueDiscipline {
        self.discipline
    }

    /// State waiters block in
    pub fn state(&self) -> States {
        self.state
    }

    pub fn timeout_status(&self) -> WaitStatus {
        self.timeout_status
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn first(&self) -> Option<ThreadId> {
        self.waiters.front().map(|waiter| waiter.thread)
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.waiters.iter().any(|waiter| waiter.thread == thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().map(|waiter| waiter.thread)
    }

    pub(crate) fn insert(&mut self, thread: ThreadId, priority: Priority) {
        let waiter = Waiter { thread, priority };
        match self.discipline {
            QueueDiscipline::Fifo => self.waiters.push_back(waiter),
            QueueDiscipline::Priority => {
                let position = self
                    .waiters
                    .iter()
                    .position(|other| other.priority > priority)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(position, waiter);
            }
        }
    }

    pub(crate) fn remove(&mut self, thread: ThreadId) -> bool {
        match self.waiters.iter().position(|waiter| waiter.thread == thread) {
            Some(position) => {
                self.waiters.remove(position);
                true
            }
            None => false,
        }
    }

    pub(crate) fn pop_first(&mut self) -> Option<ThreadId> {
        self.waiters.pop_front().map(|waiter| waiter.thread)
    }

    /// Reposition after a priority change
    pub(crate) fn requeue(&mut self, thread: ThreadId, priority: Priority) {
        if self.discipline == QueueDiscipline::Priority && self.remove(thread) {
            self.insert(thread, priority);
        }
    }
}

/// All thread queues known to the core
#[derive(Debug, Default)]
pub struct QueueTable {
    queues: BTreeMap<QueueId, ThreadQueue>,
    next: u32,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: QueueId) -> Option<&ThreadQueue> {
        self.queues.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: QueueId) -> Option<&mut ThreadQueue> {
        self.queues.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn insert(&mut self, queue: ThreadQueue) -> QueueId {
        self.next = self.next.wrapping_add(1);
        let id = QueueId(self.next);
        self.queues.insert(id, queue);
        id
    }

    fn remove(&mut self, id: QueueId) -> Option<ThreadQueue> {
        self.queues.remove(&id)
    }
}

impl Score {
    /// Create a queue whose waiters block in `state`
    pub fn queue_create(
        &mut self,
        discipline: QueueDiscipline,
        state: States,
        timeout_status: WaitStatus,
    ) -> QueueId {
        score_assert!(
            state.is_waiting_on_thread_queue(),
            InternalError::InvalidQueueState
        );
        self.queues
            .insert(ThreadQueue::new(discipline, state, timeout_status))
    }

    /// Release all waiters with `ObjectWasDeleted` and drop the queue
    pub fn queue_delete(&mut self, queue: QueueId) -> usize {
        let released = self.queue_flush(queue, WaitStatus::ObjectWasDeleted);
        self.queues.remove(queue);
        released
    }

    pub fn queue(&self, queue: QueueId) -> Option<&ThreadQueue> {
        self.queues.get(queue)
    }

    /// Satisfy the first waiter
    pub fn queue_dequeue(&mut self, queue: QueueId) -> Option<ThreadId> {
        let level = self.isr_disable();
        let Some(thread_queue) = self.queues.get_mut(queue) else {
            fatal(InternalError::UnknownQueue)
        };
        let first = thread_queue.pop_first();
        if let Some(id) = first {
            self.release_waiter(id, WaitStatus::Successful);
        }
        self.isr_enable(level);
        first
    }

    /// Remove `id` from `queue` without changing its wait status
    pub fn queue_extract(&mut self, queue: QueueId, id: ThreadId) -> bool {
        let level = self.isr_disable();
        let extracted = self
            .queues
            .get_mut(queue)
            .map_or(false, |thread_queue| thread_queue.remove(id));
        if extracted {
            let status = self
                .threads
                .get(id)
                .map_or(WaitStatus::Successful, |thread| thread.wait.return_code);
            self.release_waiter(id, status);
        }
        self.isr_enable(level);
        extracted
    }

    /// Release every waiter with `status`, in queue order
    pub fn queue_flush(&mut self, queue: QueueId, status: WaitStatus) -> usize {
        let mut released = 0;
        loop {
            let level = self.isr_disable();
            let next = self
                .queues
                .get_mut(queue)
                .and_then(|thread_queue| thread_queue.pop_first());
            let Some(id) = next else {
                self.isr_enable(level);
                break;
            };
            self.release_waiter(id, status);
            self.isr_enable(level);
            released += 1;
        }
        released
    }

    /// Finish the wait of a thread already taken off its queue
    fn release_waiter(&mut self, id: ThreadId, status: WaitStatus) {
        if let Some(thread) = self.threads.get_mut(id) {
            thread.wait.queue = None;
            thread.wait.return_code = status;
        }
        self.disarm_timer(id);
        self.clear_state(id, States::BLOCKED);
    }
}
