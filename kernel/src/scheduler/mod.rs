//! Scheduler framework
//!
//! The policy owns the ready set and its ordering; the [`Score`] owns the
//! processors and decides which heirs change. Lower priority values are
//! more urgent.
//!
//! Heir rules:
//! - heirs that are still among the most urgent threads stay where they are
//! - a wanted thread still executing on a processor goes back to that
//!   processor, never to another one
//! - an heir that already executes is kept if it is not preemptible, unless
//!   the caller forces a reschedule
//! - any other heir is replaced

pub mod edf;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};

use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::percpu::CpuIndex;
use crate::score::Score;
use crate::score_assert;
use crate::thread::{Thread, ThreadId};
use crate::watchdog::{Interval, Ticks};

use self::edf::EdfNode;

/// Scheduling priority, lower is more urgent
pub type Priority = u64;

/// Per-thread scheduler payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SchedulerInfo {
    #[default]
    Unallocated,
    Edf(EdfNode),
}

impl SchedulerInfo {
    pub fn is_allocated(&self) -> bool {
        !matches!(self, Self::Unallocated)
    }
}

/// Scheduling policy plugged into the core
pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;

    /// Attach the policy payload to a new thread
    fn allocate(&mut self, thread: &mut Thread) -> ScoreResult<()>;

    fn free(&mut self, thread: &mut Thread);

    /// Insert a ready thread behind threads of equal priority
    fn enqueue(&mut self, thread: &mut Thread);

    /// Insert a ready thread ahead of threads of equal priority
    fn enqueue_first(&mut self, thread: &mut Thread);

    /// Remove a thread from the ready set; `false` if it was not there
    fn dequeue(&mut self, thread: &mut Thread) -> bool;

    fn is_queued(&self, thread: &Thread) -> bool;

    /// The `processor_count` most urgent ready threads, most urgent first
    fn schedule(&self, processor_count: usize) -> Vec<ThreadId>;

    fn ready_count(&self) -> usize;

    fn priority_compare(&self, left: Priority, right: Priority) -> Ordering;

    /// Priority of the next job of `thread` released at `now`
    fn release_job(&self, thread: &Thread, deadline: Interval, now: Ticks) -> Priority;

    /// Priority given to idle threads
    fn idle_priority(&self) -> Priority;
}

impl Score {
    /// Remove a thread that stopped being ready from the ready set
    pub(crate) fn block_scheduler(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get_mut(id) else {
            fatal(InternalError::UnknownThread)
        };
        self.scheduler.dequeue(thread);

        let force = self
            .cpus
            .iter()
            .any(|cpu| cpu.heir == Some(id) || cpu.executing == Some(id));
        self.schedule(force);
        self.check_ready_set();
    }

    /// Add a thread that became ready to the ready set
    pub(crate) fn unblock_scheduler(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get_mut(id) else {
            fatal(InternalError::UnknownThread)
        };
        self.scheduler.enqueue(thread);
        self.schedule(false);
        self.check_ready_set();
    }

    /// Move a ready thread behind its equals
    pub fn yield_thread(&mut self, id: ThreadId) {
        let level = self.isr_disable();
        if let Some(thread) = self.threads.get_mut(id) {
            if thread.current_state.is_ready() && self.scheduler.dequeue(thread) {
                self.scheduler.enqueue(thread);
                self.schedule(false);
            }
        }
        self.isr_enable(level);
    }

    /// Set the effective priority of `id`
    ///
    /// A ready thread is re-inserted into the ready set, ahead of its new
    /// equals when `prepend` is set. A thread waiting on a priority queue
    /// is repositioned there.
    pub fn change_priority(&mut self, id: ThreadId, priority: Priority, prepend: bool) {
        let level = self.isr_disable();
        let (is_ready, queue) = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            thread.current_priority = priority;
            (thread.current_state.is_ready(), thread.wait.queue)
        };

        if let Some(queue) = queue.and_then(|queue| self.queues.get_mut(queue)) {
            queue.requeue(id, priority);
        }
        if is_ready {
            if let Some(thread) = self.threads.get_mut(id) {
                self.scheduler.dequeue(thread);
                if prepend {
                    self.scheduler.enqueue_first(thread);
                } else {
                    self.scheduler.enqueue(thread);
                }
            }
            self.schedule(false);
            self.check_ready_set();
        }
        self.isr_enable(level);
    }

    /// Set the priority requested by the owner of `id`
    ///
    /// While resources are held only a more urgent priority takes effect
    /// immediately; the rest is applied when the last resource goes.
    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) -> ScoreResult<()> {
        let thread = self
            .threads
            .get_mut(id)
            .ok_or(ScoreError::InvalidId { id })?;
        thread.real_priority = priority;
        let apply = thread.resource_count == 0
            || self.scheduler.priority_compare(priority, thread.current_priority) == Ordering::Less;
        if apply {
            self.change_priority(id, priority, false);
        }
        Ok(())
    }

    /// Raise `id` to `priority` if that is more urgent
    pub fn set_priority_if_higher(&mut self, id: ThreadId, priority: Priority) -> bool {
        let current = match self.threads.get(id) {
            Some(thread) => thread.current_priority,
            None => return false,
        };
        if self.scheduler.priority_compare(priority, current) == Ordering::Less {
            self.change_priority(id, priority, false);
            true
        } else {
            false
        }
    }

    pub fn resource_acquired(&mut self, id: ThreadId) -> ScoreResult<()> {
        self.thread_mut_or_err(id)?.resource_count += 1;
        Ok(())
    }

    /// Drop a resource; releasing the last one restores the real priority
    pub fn resource_released(&mut self, id: ThreadId) -> ScoreResult<()> {
        let thread = self.thread_mut_or_err(id)?;
        score_assert!(
            thread.resource_count > 0,
            InternalError::ResourceCountUnderflow
        );
        thread.resource_count -= 1;
        if thread.resource_count == 0 && thread.current_priority != thread.real_priority {
            let real = thread.real_priority;
            self.change_priority(id, real, true);
        }
        Ok(())
    }

    /// Release the next job of `id`, `deadline` ticks from now
    ///
    /// A zero deadline returns the thread to its initial priority.
    pub fn release_job(&mut self, id: ThreadId, deadline: Interval) -> ScoreResult<()> {
        let now = self.ticks;
        let thread = self
            .threads
            .get_mut(id)
            .ok_or(ScoreError::InvalidId { id })?;
        let priority = self.scheduler.release_job(thread, deadline, now);
        thread.real_priority = priority;
        self.change_priority(id, priority, true);
        Ok(())
    }

    pub fn priority_compare(&self, left: Priority, right: Priority) -> Ordering {
        self.scheduler.priority_compare(left, right)
    }

    /// Bring the heirs of all online processors in line with the ready set
    pub(crate) fn schedule(&mut self, force: bool) {
        let online: Vec<CpuIndex> = self
            .cpus
            .iter()
            .filter(|cpu| cpu.is_up())
            .map(|cpu| cpu.index())
            .collect();
        if online.is_empty() {
            return;
        }

        let wanted = self.scheduler.schedule(online.len());
        let is_heir = |score: &Self, id: ThreadId| {
            online.iter().any(|&cpu| score.cpus[cpu].heir == Some(id))
        };

        // Threads in the air return to the processor they execute on
        loop {
            let home = wanted.iter().copied().find_map(|id| {
                if is_heir(self, id) {
                    return None;
                }
                online
                    .iter()
                    .copied()
                    .find(|&cpu| self.cpus[cpu].executing == Some(id))
                    .map(|cpu| (cpu, id))
            });
            let Some((cpu, id)) = home else { break };
            self.update_heir(cpu, id);
        }

        let mut pending: VecDeque<ThreadId> = wanted
            .iter()
            .copied()
            .filter(|&id| !is_heir(self, id))
            .collect();
        if pending.is_empty() {
            return;
        }

        // Processors whose heir is no longer wanted, least urgent heir first
        let mut victims: Vec<(CpuIndex, bool, Priority)> = online
            .iter()
            .filter_map(|&cpu| {
                let heir = self.cpus[cpu].heir;
                if heir.map_or(false, |heir| wanted.contains(&heir)) {
                    return None;
                }
                match heir.and_then(|heir| self.threads.get(heir)) {
                    Some(thread) => Some((cpu, thread.current_state.is_ready(), thread.current_priority)),
                    None => Some((cpu, false, Priority::MAX)),
                }
            })
            .collect();
        victims.sort_by_key(|&(_, is_ready, priority)| (is_ready, Reverse(priority)));

        for (cpu, _, _) in victims {
            let Some(&candidate) = pending.front() else {
                break;
            };
            let executing = self.cpus[cpu].executing;
            let replace = match self.cpus[cpu].heir.and_then(|heir| self.threads.get(heir)) {
                Some(heir) if executing == Some(heir.id()) => {
                    force || heir.is_preemptible || !heir.current_state.is_ready()
                }
                _ => true,
            };
            if replace {
                pending.pop_front();
                self.update_heir(cpu, candidate);
            }
        }
    }

    fn update_heir(&mut self, cpu: CpuIndex, heir: ThreadId) {
        if let Some(previous) = self.cpus[cpu].heir {
            let running_on = self
                .cpus
                .iter()
                .position(|other| other.executing == Some(previous));
            if let Some(thread) = self.threads.get_mut(previous) {
                thread.is_scheduled = false;
                thread.cpu = running_on;
            }
        }
        if let Some(thread) = self.threads.get_mut(heir) {
            thread.is_scheduled = true;
            thread.cpu = Some(cpu);
        }
        self.cpus[cpu].heir = Some(heir);
        self.cpus[cpu].dispatch_necessary = true;
        log::trace!("[SCHED] cpu{} heir {}", cpu, heir);
    }

    #[cfg(debug_assertions)]
    fn check_ready_set(&self) {
        let ready_threads = self.threads.iter().filter(|thread| thread.is_ready()).count();
        let ready_set = self.scheduler.ready_count();
        score_assert!(
            ready_set == ready_threads,
            InternalError::ReadySetMismatch {
                ready_set,
                ready_threads
            }
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_ready_set(&self) {}

    pub(crate) fn thread_or_err(&self, id: ThreadId) -> ScoreResult<&Thread> {
        self.threads.get(id).ok_or(ScoreError::InvalidId { id })
    }

    pub(crate) fn thread_mut_or_err(&mut self, id: ThreadId) -> ScoreResult<&mut Thread> {
        self.threads.get_mut(id).ok_or(ScoreError::InvalidId { id })
    }
}
