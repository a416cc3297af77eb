//! Per-processor control
//!
//! Each processor tracks the thread it executes, the heir selected by the
//! scheduler and whether a dispatch is pending. The interrupt disable depth
//! stands in for the hardware ISR level: the core checks it where the
//! hardware would require interrupts to be off.

use crate::error::InternalError;
use crate::score_assert;
use crate::thread::ThreadId;

pub type CpuIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Not yet brought up
    Initial,
    /// Executing threads
    Up,
    /// Stopped, no longer scheduled
    ShutDown,
}

/// Interrupt level saved by [`PerCpu::isr_disable`]
#[must_use = "the saved level must be handed back to isr_enable"]
#[derive(Debug, PartialEq, Eq)]
pub struct IsrLevel(u32);

#[derive(Debug)]
pub struct PerCpu {
    index: CpuIndex,
    state: CpuState,
    pub(crate) executing: Option<ThreadId>,
    pub(crate) heir: Option<ThreadId>,
    pub(crate) dispatch_necessary: bool,
    isr_disable_depth: u32,
}

impl PerCpu {
    pub const fn new(index: CpuIndex) -> Self {
        Self {
            index,
            state: CpuState::Initial,
            executing: None,
            heir: None,
            dispatch_necessary: false,
            isr_disable_depth: 0,
        }
    }

    pub fn index(&self) -> CpuIndex {
        self.index
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == CpuState::Up
    }

    pub fn executing(&self) -> Option<ThreadId> {
        self.executing
    }

    pub fn heir(&self) -> Option<ThreadId> {
        self.heir
    }

    pub fn dispatch_necessary(&self) -> bool {
        self.dispatch_necessary
    }

    /// Start executing `idle`
    pub fn bring_up(&mut self, idle: ThreadId) {
        score_assert!(self.state == CpuState::Initial, InternalError::ProcessorNotUp);
        self.executing = Some(idle);
        self.heir = Some(idle);
        self.dispatch_necessary = false;
        self.state = CpuState::Up;
        log::info!("[CPU{}] up, idle thread {}", self.index, idle);
    }

    pub fn shut_down(&mut self) {
        self.state = CpuState::ShutDown;
        self.executing = None;
        self.heir = None;
        self.dispatch_necessary = false;
        log::info!("[CPU{}] shut down", self.index);
    }

    pub fn isr_disable(&mut self) -> IsrLevel {
        let level = IsrLevel(self.isr_disable_depth);
        self.isr_disable_depth += 1;
        level
    }

    pub fn isr_enable(&mut self, level: IsrLevel) {
        score_assert!(
            self.isr_disable_depth == level.0 + 1,
            InternalError::IsrLevelMismatch
        );
        self.isr_disable_depth = level.0;
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.isr_disable_depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectApi, ObjectId, THREAD_CLASS};

    #[test]
    fn test_isr_levels_nest() {
        let mut cpu = PerCpu::new(0);
        let outer = cpu.isr_disable();
        let inner = cpu.isr_disable();
        assert!(cpu.interrupts_disabled());
        cpu.isr_enable(inner);
        assert!(cpu.interrupts_disabled());
        cpu.isr_enable(outer);
        assert!(!cpu.interrupts_disabled());
    }

    #[test]
    #[should_panic(expected = "IsrLevelMismatch")]
    fn test_isr_enable_out_of_order() {
        let mut cpu = PerCpu::new(0);
        let outer = cpu.isr_disable();
        let _inner = cpu.isr_disable();
        cpu.isr_enable(outer);
    }

    #[test]
    fn test_bring_up_and_shut_down() {
        let idle = ObjectId::build(ObjectApi::Internal, THREAD_CLASS, 1, 1);
        let mut cpu = PerCpu::new(3);
        assert_eq!(cpu.state(), CpuState::Initial);
        cpu.bring_up(idle);
        assert!(cpu.is_up());
        assert_eq!(cpu.executing(), Some(idle));
        assert_eq!(cpu.heir(), Some(idle));
        cpu.shut_down();
        assert_eq!(cpu.state(), CpuState::ShutDown);
        assert_eq!(cpu.executing(), None);
    }
}
