//! Thread control block
//!
//! The [`Thread`] record holds everything the core knows about a thread:
//! its state set, priorities, wait record, timer, CPU budget, scheduler
//! payload, post-switch actions and life-cycle state. Threads live in the
//! [`ThreadPool`](pool::ThreadPool) owned by the [`Score`](crate::Score)
//! and are always referred to by [`ThreadId`].

pub mod action;
pub mod budget;
pub mod extension;
pub mod keys;
pub mod life;
pub mod pool;
pub mod states;
pub mod threadq;
pub mod wait;

use alloc::boxed::Box;

use crate::object::{ObjectApi, ObjectId};
use crate::percpu::CpuIndex;
use crate::scheduler::{Priority, SchedulerInfo};

use self::action::ActionControl;
use self::budget::{BudgetAlgorithm, BudgetCallout};
use self::life::{LifeControl, LifeState};
use self::states::States;
use self::wait::{TimerControl, WaitInfo};

/// Thread handle
pub type ThreadId = ObjectId;

/// API that created a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadApi {
    Internal,
    Classic,
    Posix,
}

impl ThreadApi {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        match self {
            Self::Internal => 0,
            Self::Classic => 1,
            Self::Posix => 2,
        }
    }

    pub const fn object_api(self) -> ObjectApi {
        match self {
            Self::Internal => ObjectApi::Internal,
            Self::Classic => ObjectApi::Classic,
            Self::Posix => ObjectApi::Posix,
        }
    }
}

/// Argument passed to the entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryArgument {
    Numeric(usize),
    Pointer(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub entry_point: usize,
    pub argument: EntryArgument,
}

impl ThreadEntry {
    pub const fn new(entry_point: usize, argument: EntryArgument) -> Self {
        Self {
            entry_point,
            argument,
        }
    }
}

/// Attributes captured at creation, reloaded on restart
#[derive(Debug, Clone, Copy)]
pub struct StartInfo {
    pub entry: Option<ThreadEntry>,
    pub is_preemptible: bool,
    pub budget_algorithm: BudgetAlgorithm,
    pub budget_callout: Option<BudgetCallout>,
    pub isr_level: u32,
    pub initial_priority: Priority,
}

/// Creation parameters
#[derive(Debug, Clone)]
pub struct ThreadAttributes<'a> {
    pub name: &'a str,
    pub api: ThreadApi,
    pub priority: Priority,
    pub is_preemptible: bool,
    pub budget_algorithm: BudgetAlgorithm,
    pub budget_callout: Option<BudgetCallout>,
    pub isr_level: u32,
}

impl<'a> ThreadAttributes<'a> {
    pub fn new(name: &'a str, priority: Priority) -> Self {
        Self {
            name,
            api: ThreadApi::Classic,
            priority,
            is_preemptible: true,
            budget_algorithm: BudgetAlgorithm::None,
            budget_callout: None,
            isr_level: 0,
        }
    }

    pub fn api(mut self, api: ThreadApi) -> Self {
        self.api = api;
        self
    }

    pub fn preemptible(mut self, is_preemptible: bool) -> Self {
        self.is_preemptible = is_preemptible;
        self
    }

    pub fn budget(mut self, algorithm: BudgetAlgorithm, callout: Option<BudgetCallout>) -> Self {
        self.budget_algorithm = algorithm;
        self.budget_callout = callout;
        self
    }

    pub fn isr_level(mut self, level: u32) -> Self {
        self.isr_level = level;
        self
    }
}

/// Thread control block
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    name: Box<str>,
    api: ThreadApi,

    pub(crate) current_state: States,
    /// Effective priority, may be raised by inheritance
    pub(crate) current_priority: Priority,
    /// Priority requested by the owner
    pub(crate) real_priority: Priority,
    /// Resources held; blocks priority restoration while non-zero
    pub(crate) resource_count: u32,

    pub(crate) wait: WaitInfo,
    pub(crate) timer: TimerControl,

    pub(crate) is_preemptible: bool,
    /// Selected as heir or executing on some processor
    pub(crate) is_scheduled: bool,
    pub(crate) cpu: Option<CpuIndex>,

    pub(crate) budget_algorithm: BudgetAlgorithm,
    pub(crate) budget_callout: Option<BudgetCallout>,
    pub(crate) cpu_time_budget: u32,
    /// Ticks charged while executing
    pub(crate) cpu_time_used: u64,

    pub(crate) scheduler_info: SchedulerInfo,
    pub(crate) start: StartInfo,
    pub(crate) post_switch_actions: ActionControl,
    pub(crate) life: LifeControl,
    pub(crate) restart_count: u32,
}

impl Thread {
    /// Build a dormant thread; the scheduler payload is allocated separately
    pub fn new(id: ThreadId, attributes: &ThreadAttributes<'_>, ticks_per_timeslice: u32) -> Self {
        Self {
            id,
            name: attributes.name.into(),
            api: attributes.api,
            current_state: States::DORMANT,
            current_priority: attributes.priority,
            real_priority: attributes.priority,
            resource_count: 0,
            wait: WaitInfo::new(),
            timer: TimerControl::new(),
            is_preemptible: attributes.is_preemptible,
            is_scheduled: false,
            cpu: None,
            budget_algorithm: attributes.budget_algorithm,
            budget_callout: attributes.budget_callout,
            cpu_time_budget: ticks_per_timeslice,
            cpu_time_used: 0,
            scheduler_info: SchedulerInfo::Unallocated,
            start: StartInfo {
                entry: None,
                is_preemptible: attributes.is_preemptible,
                budget_algorithm: attributes.budget_algorithm,
                budget_callout: attributes.budget_callout,
                isr_level: attributes.isr_level,
                initial_priority: attributes.priority,
            },
            post_switch_actions: ActionControl::new(),
            life: LifeControl::new(),
            restart_count: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> ThreadApi {
        self.api
    }

    pub fn state(&self) -> States {
        self.current_state
    }

    pub fn is_ready(&self) -> bool {
        self.current_state.is_ready()
    }

    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    pub fn real_priority(&self) -> Priority {
        self.real_priority
    }

    pub fn resource_count(&self) -> u32 {
        self.resource_count
    }

    pub fn wait(&self) -> &WaitInfo {
        &self.wait
    }

    pub fn timer(&self) -> &TimerControl {
        &self.timer
    }

    pub fn is_preemptible(&self) -> bool {
        self.is_preemptible
    }

    pub fn is_scheduled(&self) -> bool {
        self.is_scheduled
    }

    pub fn cpu(&self) -> Option<CpuIndex> {
        self.cpu
    }

    pub fn budget_algorithm(&self) -> BudgetAlgorithm {
        self.budget_algorithm
    }

    pub fn cpu_time_budget(&self) -> u32 {
        self.cpu_time_budget
    }

    pub fn cpu_time_used(&self) -> u64 {
        self.cpu_time_used
    }

    pub fn scheduler_info(&self) -> &SchedulerInfo {
        &self.scheduler_info
    }

    pub fn start_info(&self) -> &StartInfo {
        &self.start
    }

    pub fn post_switch_actions(&self) -> &ActionControl {
        &self.post_switch_actions
    }

    pub fn life_state(&self) -> LifeState {
        self.life.state
    }

    /// Thread waiting for this one to terminate
    pub fn terminator(&self) -> Option<ThreadId> {
        self.life.terminator
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}
