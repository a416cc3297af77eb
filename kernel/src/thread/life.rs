//! Thread life cycle: restart, terminate and protection
//!
//! A restart or termination request is recorded in the life state and
//! carried out by the life action, which runs on the target thread right
//! after it is switched in. While a thread is protected requests are only
//! recorded; dropping protection starts them.

use bitflags::bitflags;

use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::scheduler::Priority;
use crate::score::Score;

use super::action::{ActionGuard, ActionReleased, ThreadAction};
use super::states::States;
use super::wait::WaitInfo;
use super::{EntryArgument, ThreadId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LifeState: u8 {
        const PROTECTED   = 0x1;
        const RESTARTING  = 0x2;
        const TERMINATING = 0x4;
    }
}

impl LifeState {
    pub const NORMAL: Self = Self::empty();

    pub const LIFE_IS_CHANGING: Self =
        Self::from_bits_retain(Self::RESTARTING.bits() | Self::TERMINATING.bits());

    #[inline]
    pub fn is_protected(self) -> bool {
        self.contains(Self::PROTECTED)
    }

    #[inline]
    pub fn is_restarting(self) -> bool {
        self.contains(Self::RESTARTING)
    }

    #[inline]
    pub fn is_terminating(self) -> bool {
        self.contains(Self::TERMINATING)
    }

    #[inline]
    pub fn is_life_changing(self) -> bool {
        self.intersects(Self::LIFE_IS_CHANGING)
    }
}

#[derive(Debug)]
pub struct LifeControl {
    pub(crate) action: ThreadAction,
    pub(crate) state: LifeState,
    /// Thread waiting for this one to terminate
    pub(crate) terminator: Option<ThreadId>,
    pub(crate) restart_argument: Option<EntryArgument>,
}

impl LifeControl {
    pub fn new() -> Self {
        Self {
            action: ThreadAction::initialize(life_action_handler),
            state: LifeState::NORMAL,
            terminator: None,
            restart_argument: None,
        }
    }

    pub fn state(&self) -> LifeState {
        self.state
    }

    pub fn terminator(&self) -> Option<ThreadId> {
        self.terminator
    }
}

impl Default for LifeControl {
    fn default() -> Self {
        Self::new()
    }
}

impl Score {
    /// Restart `id` with a new entry argument
    ///
    /// A dormant thread has never run and cannot be restarted.
    pub fn request_restart(&mut self, id: ThreadId, argument: EntryArgument) -> ScoreResult<()> {
        let thread = self.thread_mut_or_err(id)?;
        let state = thread.current_state;
        if state.is_dormant() || state.is_zombie() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        thread.life.restart_argument = Some(argument);
        let priority = thread.start.initial_priority;
        self.request_life_change(id, LifeState::RESTARTING, priority);
        Ok(())
    }

    /// Terminate `id`
    ///
    /// A dormant thread becomes a zombie at once. Otherwise the optional
    /// `terminator` waits in `WAITING_FOR_TERMINATION` until `id` is gone.
    /// The victim runs its termination at the priority of the terminator,
    /// or of the executing thread when there is none.
    pub fn request_terminate(&mut self, id: ThreadId, terminator: Option<ThreadId>) -> ScoreResult<()> {
        let thread = self.thread_or_err(id)?;
        let state = thread.current_state;
        let initial_priority = thread.start.initial_priority;
        if state.is_zombie() {
            return Err(ScoreError::IncorrectState { id, state });
        }
        if state.is_dormant() {
            self.make_zombie(id);
            return Ok(());
        }

        let terminator = terminator.filter(|&terminator| terminator != id);
        let priority = match terminator.or(self.cpus[self.current].executing) {
            Some(requester) => self.thread_or_err(requester)?.current_priority,
            None => initial_priority,
        };
        if let Some(terminator) = terminator {
            if let Some(thread) = self.threads.get_mut(id) {
                thread.life.terminator = Some(terminator);
            }
            self.set_state(terminator, States::WAITING_FOR_TERMINATION);
        }
        self.request_life_change(id, LifeState::TERMINATING, priority);
        Ok(())
    }

    fn request_life_change(&mut self, id: ThreadId, change: LifeState, priority: Priority) {
        let level = self.isr_disable();
        let previous = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            let previous = thread.life.state;
            thread.life.state |= change;
            previous
        };
        self.isr_enable(level);

        if previous.is_protected() {
            log::debug!("[LIFE] {} protected, {:?} deferred", id, change);
        } else if self.is_executing(id) {
            self.start_life_change_for_executing(id);
        } else if !previous.is_life_changing() {
            self.start_life_change(id, priority);
        }
    }

    /// Hand the change to a thread that is not executing
    ///
    /// Its start attributes come back, any wait is abandoned and it is made
    /// ready, raised to at least `priority`, so the life action gets to run.
    fn start_life_change(&mut self, id: ThreadId, priority: Priority) {
        {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            thread.is_preemptible = thread.start.is_preemptible;
            thread.budget_algorithm = thread.start.budget_algorithm;
            thread.budget_callout = thread.start.budget_callout;
        }
        self.abort_wait(id);

        let level = self.isr_disable();
        let action = self.life_action(id);
        self.add_post_switch_action(id, action);
        self.isr_enable(level);

        self.set_priority_if_higher(id, priority);
        self.clear_state(id, States::BLOCKED | States::SUSPENDED);
        log::debug!("[LIFE] {} life change started", id);
    }

    fn start_life_change_for_executing(&mut self, id: ThreadId) {
        let level = self.isr_disable();
        let action = self.life_action(id);
        self.add_post_switch_action(id, action);
        self.isr_enable(level);

        if let Some(cpu) = self.cpus.iter_mut().find(|cpu| cpu.executing == Some(id)) {
            cpu.dispatch_necessary = true;
        }
    }

    fn life_action(&self, id: ThreadId) -> ThreadAction {
        match self.threads.get(id) {
            Some(thread) => thread.life.action,
            None => fatal(InternalError::UnknownThread),
        }
    }

    pub fn protect(&mut self) -> bool {
        self.set_life_protection(true)
    }

    pub fn unprotect(&mut self) -> bool {
        self.set_life_protection(false)
    }

    /// Set the protection of the executing thread, returning the previous
    /// protection
    ///
    /// Dropping protection with a pending change starts that change.
    pub fn set_life_protection(&mut self, protect: bool) -> bool {
        let Some(id) = self.cpus[self.current].executing else {
            fatal(InternalError::NoExecutingThread)
        };
        let level = self.isr_disable();
        let previous = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            let previous = thread.life.state;
            thread.life.state.set(LifeState::PROTECTED, protect);
            previous
        };
        self.isr_enable(level);

        if !protect && previous.is_life_changing() {
            self.start_life_change_for_executing(id);
        }
        previous.is_protected()
    }

    /// Reload the start environment of `id` after a restart
    fn restart_self(&mut self, id: ThreadId) {
        let ticks_per_timeslice = self.config.ticks_per_timeslice;
        let initial_priority = {
            let Some(thread) = self.threads.get_mut(id) else {
                fatal(InternalError::UnknownThread)
            };
            thread.is_preemptible = thread.start.is_preemptible;
            thread.budget_algorithm = thread.start.budget_algorithm;
            thread.budget_callout = thread.start.budget_callout;
            thread.cpu_time_budget = ticks_per_timeslice;
            thread.real_priority = thread.start.initial_priority;
            thread.resource_count = 0;
            thread.wait = WaitInfo::new();
            if let (Some(argument), Some(entry)) =
                (thread.life.restart_argument.take(), thread.start.entry.as_mut())
            {
                entry.argument = argument;
            }
            thread.life.state = LifeState::NORMAL;
            thread.restart_count += 1;
            thread.start.initial_priority
        };
        self.change_priority(id, initial_priority, true);
        self.stats.restarts += 1;
        log::info!("[LIFE] {} restarted", id);
    }
}

fn life_action_handler(
    score: &mut Score,
    id: ThreadId,
    _action: ThreadAction,
    guard: ActionGuard,
) -> ActionReleased {
    let pending = match score.threads.get_mut(id) {
        Some(thread) => {
            let state = thread.life.state;
            if state.is_protected() || !state.is_life_changing() {
                None
            } else {
                thread.life.state = LifeState::PROTECTED;
                Some(state)
            }
        }
        None => None,
    };
    let released = guard.release(score);

    match pending {
        Some(state) if state.is_terminating() => score.make_zombie(id),
        Some(_) => score.restart_self(id),
        None => {}
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreConfig;
    use crate::scheduler::edf::deadline;
    use crate::thread::wait::{Timeout, WaitStatus};
    use crate::thread::threadq::QueueDiscipline;
    use crate::thread::{ThreadAttributes, ThreadEntry};

    fn started(score: &mut Score, name: &str, priority: u64) -> ThreadId {
        let id = score
            .thread_create(&ThreadAttributes::new(name, priority))
            .unwrap();
        score
            .thread_start(id, ThreadEntry::new(0x4000, EntryArgument::Numeric(0)))
            .unwrap();
        id
    }

    #[test]
    fn test_protected_termination_is_deferred() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let t = started(&mut score, "T", deadline(10));
        assert_eq!(score.dispatch(0), Some(t));

        assert!(!score.protect());
        score.request_terminate(t, None).unwrap();
        score.dispatch(0);
        let thread = score.thread(t).unwrap();
        assert!(thread.life_state().is_terminating());
        assert!(thread.post_switch_actions().is_empty());
        assert_eq!(score.executing(0), Some(t));

        assert!(score.unprotect());
        score.dispatch(0);
        assert!(score.thread(t).is_none());
        assert_ne!(score.executing(0), Some(t));
        assert_eq!(score.stats().threads_terminated, 1);

        score.dispatch(0);
        assert_eq!(score.stats().threads_terminated, 1);
    }

    #[test]
    fn test_terminator_waits_for_victim() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let a = started(&mut score, "A", deadline(10));
        let b = started(&mut score, "B", deadline(20));
        assert_eq!(score.dispatch(0), Some(a));

        score.request_terminate(b, Some(a)).unwrap();
        assert!(score
            .thread(a)
            .unwrap()
            .state()
            .contains(States::WAITING_FOR_TERMINATION));

        assert_eq!(score.dispatch(0), Some(a));
        assert!(score.thread(b).is_none());
        assert!(score.thread(a).unwrap().is_ready());
    }

    #[test]
    fn test_victim_runs_at_terminator_priority() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let terminator = started(&mut score, "A", deadline(10));
        let victim = started(&mut score, "V", deadline(200));
        let middle = started(&mut score, "M", deadline(50));
        assert_eq!(score.dispatch(0), Some(terminator));

        score.request_terminate(victim, Some(terminator)).unwrap();
        assert_eq!(score.thread(victim).unwrap().current_priority(), deadline(10));
        assert_eq!(score.heir(0), Some(victim));

        assert_eq!(score.dispatch(0), Some(terminator));
        assert!(score.thread(victim).is_none());
        assert!(score.thread(middle).unwrap().is_ready());
        assert_eq!(score.stats().context_switches, 3);
    }

    #[test]
    fn test_terminate_blocked_thread_abandons_wait() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let a = started(&mut score, "A", deadline(10));
        let queue = score.queue_create(
            QueueDiscipline::Fifo,
            States::WAITING_FOR_SEMAPHORE,
            WaitStatus::Timeout,
        );
        score.block(a, queue, Timeout::Ticks(10));
        score.request_terminate(a, None).unwrap();

        assert!(score.queue(queue).unwrap().is_empty());
        assert!(score.thread(a).unwrap().is_ready());
        score.dispatch(0);
        assert!(score.thread(a).is_none());
    }

    #[test]
    fn test_terminate_dormant_thread_is_immediate() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let id = score
            .thread_create(&ThreadAttributes::new("D", deadline(10)))
            .unwrap();
        score.request_terminate(id, None).unwrap();
        assert!(score.thread(id).unwrap().state().is_zombie());
        assert_eq!(score.kill_zombies(), 1);
        assert!(score.thread(id).is_none());
    }

    #[test]
    fn test_restart_reloads_start_environment() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let t = started(&mut score, "T", deadline(50));
        score.release_job(t, 10).unwrap();
        assert_ne!(score.thread(t).unwrap().current_priority(), deadline(50));
        assert_eq!(score.dispatch(0), Some(t));

        score.request_restart(t, EntryArgument::Numeric(7)).unwrap();
        score.dispatch(0);

        let thread = score.thread(t).unwrap();
        assert_eq!(thread.restart_count(), 1);
        assert_eq!(thread.current_priority(), deadline(50));
        assert_eq!(thread.real_priority(), deadline(50));
        assert_eq!(
            thread.start_info().entry.map(|entry| entry.argument),
            Some(EntryArgument::Numeric(7))
        );
        assert_eq!(thread.life_state(), LifeState::NORMAL);
        assert_eq!(score.stats().restarts, 1);
    }

    #[test]
    fn test_restart_dormant_thread_fails() {
        let mut score = Score::new(ScoreConfig::uniprocessor()).unwrap();
        let id = score
            .thread_create(&ThreadAttributes::new("D", deadline(10)))
            .unwrap();
        assert!(matches!(
            score.request_restart(id, EntryArgument::Numeric(1)),
            Err(ScoreError::IncorrectState { .. })
        ));
    }
}
