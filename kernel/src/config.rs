//! Score configuration
//!
//! Static sizing and timing parameters, validated once when the
//! [`Score`](crate::Score) is built.

use crate::error::{ScoreError, ScoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreConfig {
    /// Application threads (idle threads come on top)
    pub maximum_threads: usize,
    pub processor_count: usize,
    /// Budget of the timeslice algorithms, in ticks
    pub ticks_per_timeslice: u32,
    pub microseconds_per_tick: u32,
    /// Extension slots available to users after the per-API slots
    pub user_extension_slots: usize,
    /// Per-thread storage keys that may exist at once
    pub maximum_keys: usize,
    /// Node number encoded into object identifiers
    pub node: u8,
}

impl ScoreConfig {
    pub const MAXIMUM_PROCESSORS: usize = 32;

    pub const fn uniprocessor() -> Self {
        Self {
            maximum_threads: 32,
            processor_count: 1,
            ticks_per_timeslice: 50,
            microseconds_per_tick: 10_000,
            user_extension_slots: 4,
            maximum_keys: 16,
            node: 1,
        }
    }

    pub const fn smp(processor_count: usize) -> Self {
        let mut config = Self::uniprocessor();
        config.processor_count = processor_count;
        config
    }

    pub fn with_maximum_threads(mut self, maximum_threads: usize) -> Self {
        self.maximum_threads = maximum_threads;
        self
    }

    pub fn with_ticks_per_timeslice(mut self, ticks: u32) -> Self {
        self.ticks_per_timeslice = ticks;
        self
    }

    pub fn with_user_extension_slots(mut self, slots: usize) -> Self {
        self.user_extension_slots = slots;
        self
    }

    pub fn with_maximum_keys(mut self, keys: usize) -> Self {
        self.maximum_keys = keys;
        self
    }

    /// Thread control blocks needed, idle threads included
    pub fn thread_pool_capacity(&self) -> usize {
        self.maximum_threads + self.processor_count
    }

    pub fn validate(&self) -> ScoreResult<()> {
        let reason = if self.maximum_threads == 0 {
            "maximum_threads must be > 0"
        } else if self.processor_count == 0 {
            "processor_count must be > 0"
        } else if self.processor_count > Self::MAXIMUM_PROCESSORS {
            "processor_count exceeds MAXIMUM_PROCESSORS"
        } else if self.thread_pool_capacity() > u16::MAX as usize {
            "thread pool exceeds the 16-bit identifier index"
        } else if self.ticks_per_timeslice == 0 {
            "ticks_per_timeslice must be > 0"
        } else if self.microseconds_per_tick == 0 {
            "microseconds_per_tick must be > 0"
        } else {
            return Ok(());
        };
        Err(ScoreError::InvalidConfiguration { reason })
    }
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self::uniprocessor()
    }
}
