//! Thread pool and thread creation
//!
//! Control blocks are preallocated up to the configured maximum. A
//! terminated thread first becomes a zombie; its control block is freed by
//! [`Score::kill_zombies`] once no processor executes it anymore.

use alloc::collections::VecDeque;

use hashbrown::HashMap;

use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::score::Score;

use super::states::States;
use super::{Thread, ThreadAttributes, ThreadEntry, ThreadId};

#[derive(Debug)]
pub struct ThreadPool {
    threads: HashMap<ThreadId, Thread>,
    capacity: usize,
}

impl ThreadPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            threads: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.threads.len() >= self.capacity
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.threads.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Thread> + '_ {
        self.threads.values_mut()
    }

    /// Callers check [`ThreadPool::is_full`] first
    pub(crate) fn insert(&mut self, thread: Thread) {
        self.threads.insert(thread.id(), thread);
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.threads.remove(&id)
    }
}

impl Score {
    /// Create a dormant thread
    ///
    /// Zombies are reaped first so their control blocks can be reused.
    pub fn thread_create(&mut self, attributes: &ThreadAttributes<'_>) -> ScoreResult<ThreadId> {
        self.kill_zombies();
        if self.threads.is_full() {
            return Err(ScoreError::ThreadPoolExhausted {
                maximum: self.config.maximum_threads,
            });
        }

        let id = self
            .objects
            .allocate(attributes.api.object_api())
            .ok_or(ScoreError::IdsExhausted)?;
        let mut thread = Thread::new(id, attributes, self.config.ticks_per_timeslice);

        if let Err(error) = self.scheduler.allocate(&mut thread) {
            self.objects.free(id);
            return Err(error);
        }
        self.threads.insert(thread);
        self.extensions.attach(id);
        self.stats.threads_created += 1;

        log::debug!(
            "[THREAD] created {} '{}' priority {:#x}",
            id,
            attributes.name,
            attributes.priority
        );
        Ok(id)
    }

    /// Start a dormant thread at `entry`
    pub fn thread_start(&mut self, id: ThreadId, entry: ThreadEntry) -> ScoreResult<()> {
        let thread = self.thread_mut_or_err(id)?;
        let state = thread.current_state;
        if !state.is_dormant() || state.is_zombie() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        thread.start.entry = Some(entry);
        self.clear_state(id, States::DORMANT);
        log::debug!("[THREAD] started {} at {:#x}", id, entry.entry_point);
        Ok(())
    }

    /// Turn `id` into a zombie and wake its terminator
    pub(crate) fn make_zombie(&mut self, id: ThreadId) {
        self.abort_wait(id);
        self.set_state(id, States::ZOMBIE);

        let terminator = match self.threads.get_mut(id) {
            Some(thread) => thread.life.terminator.take(),
            None => fatal(InternalError::UnknownThread),
        };
        self.zombies.push_back(id);
        self.stats.threads_terminated += 1;

        if let Some(terminator) = terminator {
            if self.threads.contains(terminator) {
                self.clear_state(terminator, States::WAITING_FOR_TERMINATION);
            }
        }
        log::info!("[THREAD] {} terminated", id);
    }

    /// Free every zombie that no processor still executes
    pub fn kill_zombies(&mut self) -> usize {
        let mut freed = 0;
        let mut still_executing = VecDeque::new();
        while let Some(id) = self.zombies.pop_front() {
            if self.is_executing(id) {
                still_executing.push_back(id);
                continue;
            }
            self.thread_free(id);
            freed += 1;
        }
        self.zombies = still_executing;
        freed
    }

    fn thread_free(&mut self, id: ThreadId) {
        let Some(mut thread) = self.threads.remove(id) else {
            return;
        };
        self.scheduler.free(&mut thread);
        self.extensions.detach(id);
        self.keys.release(id);
        // The handle is reissued later; nobody may still wait on it
        for other in self.threads.iter_mut() {
            if other.life.terminator == Some(id) {
                other.life.terminator = None;
            }
        }
        self.objects.free(id);
        log::debug!("[THREAD] freed {} '{}'", id, thread.name());
    }
}
