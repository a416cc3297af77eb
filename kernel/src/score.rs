//! Score instance
//!
//! One [`Score`] owns every thread, thread queue, processor and
//! collaborator of the system. All operations take `&mut Score`; on SMP the
//! instance sits behind a [`SharedScore`] lock, which plays the part of the
//! system-wide scheduler lock.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::ScoreConfig;
use crate::error::{fatal, InternalError, ScoreError, ScoreResult};
use crate::object::{ObjectRegistry, ObjectTable, THREAD_CLASS};
use crate::percpu::{CpuIndex, IsrLevel, PerCpu};
use crate::scheduler::edf::EdfScheduler;
use crate::scheduler::SchedulerPolicy;
use crate::score_assert;
use crate::thread::extension::ExtensionTable;
use crate::thread::keys::KeyTable;
use crate::thread::pool::ThreadPool;
use crate::thread::threadq::QueueTable;
use crate::thread::wait::WaitInfo;
use crate::thread::{EntryArgument, Thread, ThreadApi, ThreadAttributes, ThreadEntry, ThreadId};
use crate::watchdog::{DeltaChain, Ticks, TimerSource};

/// Score behind the system lock
pub type SharedScore = spin::Mutex<Score>;

/// Event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreStats {
    pub threads_created: u64,
    pub threads_terminated: u64,
    pub restarts: u64,
    pub context_switches: u64,
    pub timeouts: u64,
    pub post_switch_actions: u64,
}

pub struct Score {
    pub(crate) config: ScoreConfig,
    pub(crate) threads: ThreadPool,
    pub(crate) scheduler: Box<dyn SchedulerPolicy>,
    pub(crate) objects: Box<dyn ObjectRegistry>,
    pub(crate) timers: Box<dyn TimerSource>,
    pub(crate) queues: QueueTable,
    pub(crate) extensions: ExtensionTable,
    pub(crate) keys: KeyTable,
    pub(crate) cpus: Vec<PerCpu>,
    /// Processor the caller runs on
    pub(crate) current: CpuIndex,
    pub(crate) zombies: VecDeque<ThreadId>,
    pub(crate) ticks: Ticks,
    pub(crate) stats: ScoreStats,
}

impl Score {
    /// Build a score with the EDF scheduler, a local object table and a
    /// delta-chain timer source
    pub fn new(config: ScoreConfig) -> ScoreResult<Self> {
        config.validate()?;
        let capacity = config.thread_pool_capacity();
        Self::with_collaborators(
            config,
            Box::new(EdfScheduler::new(capacity)),
            Box::new(ObjectTable::new(config.node, THREAD_CLASS, capacity)),
            Box::new(DeltaChain::new()),
        )
    }

    /// Build a score around the given collaborators and bring up every
    /// configured processor with its idle thread
    pub fn with_collaborators(
        config: ScoreConfig,
        scheduler: Box<dyn SchedulerPolicy>,
        objects: Box<dyn ObjectRegistry>,
        timers: Box<dyn TimerSource>,
    ) -> ScoreResult<Self> {
        config.validate()?;
        let capacity = config.thread_pool_capacity();
        let mut score = Self {
            config,
            threads: ThreadPool::with_capacity(capacity),
            scheduler,
            objects,
            timers,
            queues: QueueTable::new(),
            extensions: ExtensionTable::new(config.user_extension_slots, capacity),
            keys: KeyTable::new(config.maximum_keys),
            cpus: (0..config.processor_count).map(PerCpu::new).collect(),
            current: 0,
            zombies: VecDeque::new(),
            ticks: 0,
            stats: ScoreStats::default(),
        };
        score.bring_up_processors()?;
        log::info!(
            "[SCORE] {} scheduler, {} cpus, {} threads",
            score.scheduler.name(),
            config.processor_count,
            config.maximum_threads
        );
        Ok(score)
    }

    fn bring_up_processors(&mut self) -> ScoreResult<()> {
        let idle_priority = self.scheduler.idle_priority();
        let mut idles = Vec::with_capacity(self.cpus.len());
        for index in 0..self.cpus.len() {
            let attributes = ThreadAttributes::new("IDLE", idle_priority).api(ThreadApi::Internal);
            let id = self.thread_create(&attributes)?;
            self.thread_start(id, ThreadEntry::new(0, EntryArgument::Numeric(index)))?;
            idles.push(id);
        }
        for (index, id) in idles.into_iter().enumerate() {
            self.cpus[index].bring_up(id);
            if let Some(thread) = self.threads.get_mut(id) {
                thread.is_scheduled = true;
                thread.cpu = Some(index);
            }
        }
        Ok(())
    }

    /// Stop every processor
    pub fn shutdown(&mut self) {
        for cpu in self.cpus.iter_mut() {
            cpu.shut_down();
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn threads(&self) -> &ThreadPool {
        &self.threads
    }

    /// Caller-owned part of the wait record of `id`
    pub fn wait_mut(&mut self, id: ThreadId) -> Option<&mut WaitInfo> {
        self.threads.get_mut(id).map(|thread| &mut thread.wait)
    }

    pub fn scheduler(&self) -> &dyn SchedulerPolicy {
        self.scheduler.as_ref()
    }

    pub fn objects(&self) -> &dyn ObjectRegistry {
        self.objects.as_ref()
    }

    pub fn processor_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, index: CpuIndex) -> Option<&PerCpu> {
        self.cpus.get(index)
    }

    pub fn executing(&self, cpu: CpuIndex) -> Option<ThreadId> {
        self.cpus.get(cpu).and_then(|cpu| cpu.executing)
    }

    pub fn heir(&self, cpu: CpuIndex) -> Option<ThreadId> {
        self.cpus.get(cpu).and_then(|cpu| cpu.heir)
    }

    pub fn is_executing(&self, id: ThreadId) -> bool {
        self.cpus.iter().any(|cpu| cpu.executing == Some(id))
    }

    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    pub fn stats(&self) -> &ScoreStats {
        &self.stats
    }

    pub fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    pub fn current_processor(&self) -> CpuIndex {
        self.current
    }

    /// Select the processor subsequent calls are made from
    pub fn set_current_processor(&mut self, index: CpuIndex) -> ScoreResult<()> {
        if index >= self.cpus.len() {
            return Err(ScoreError::InvalidProcessor {
                index,
                count: self.cpus.len(),
            });
        }
        self.current = index;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Interrupt level
    // ═══════════════════════════════════════════════════════════════

    pub fn isr_disable(&mut self) -> IsrLevel {
        let cpu = self.current;
        self.cpus[cpu].isr_disable()
    }

    pub fn isr_enable(&mut self, level: IsrLevel) {
        let cpu = self.current;
        self.cpus[cpu].isr_enable(level);
    }

    pub(crate) fn isr_enable_on(&mut self, cpu: CpuIndex, level: IsrLevel) {
        self.cpus[cpu].isr_enable(level);
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.cpus[self.current].interrupts_disabled()
    }

    // ═══════════════════════════════════════════════════════════════
    // Clock and dispatch
    // ═══════════════════════════════════════════════════════════════

    /// Advance the clock by one tick
    ///
    /// Fires expired timers, then charges the tick to the thread executing
    /// on each online processor.
    pub fn clock_tick(&mut self) {
        self.ticks += 1;
        for token in self.timers.tick() {
            self.timer_fired(token);
        }
        for cpu in 0..self.cpus.len() {
            if self.cpus[cpu].is_up() {
                self.tickle_timeslice(cpu);
            }
        }
    }

    /// Switch `cpu` to its heir and run post-switch actions
    ///
    /// Repeats while actions request another dispatch, then frees the
    /// zombies nobody executes anymore. Returns the executing thread.
    pub fn dispatch(&mut self, cpu: CpuIndex) -> Option<ThreadId> {
        score_assert!(
            self.cpus.get(cpu).map_or(false, PerCpu::is_up),
            InternalError::ProcessorNotUp
        );
        let caller = self.current;
        self.current = cpu;

        loop {
            if self.cpus[cpu].dispatch_necessary {
                self.cpus[cpu].dispatch_necessary = false;
                self.context_switch(cpu);
            }
            if let Some(executing) = self.cpus[cpu].executing {
                self.run_post_switch(executing);
            }
            if !self.cpus[cpu].dispatch_necessary {
                break;
            }
        }

        self.kill_zombies();
        self.current = caller;
        self.cpus[cpu].executing
    }

    fn context_switch(&mut self, cpu: CpuIndex) {
        let executing = self.cpus[cpu].executing;
        let Some(heir) = self.cpus[cpu].heir else {
            fatal(InternalError::ProcessorNotUp)
        };
        if executing == Some(heir) {
            return;
        }

        if let Some(previous) = executing.and_then(|id| self.threads.get_mut(id)) {
            if !previous.is_scheduled {
                previous.cpu = None;
            }
        }
        self.cpus[cpu].executing = Some(heir);
        self.reset_timeslice_on_switch(heir);
        self.stats.context_switches += 1;
        log::trace!("[SCORE] cpu{} switch {:?} -> {}", cpu, executing, heir);
    }
}
