// src/lib.rs
// Cœur de gestion des threads et d'ordonnancement EDF
#![cfg_attr(not(test), no_std)]

//! Thread control and EDF scheduling core
//!
//! Thread control blocks with their state set, wait record and timer,
//! thread queues, post-switch actions, restart and termination handling,
//! CPU budgets and an Earliest-Deadline-First scheduler, all owned by one
//! [`Score`] per system.

extern crate alloc;

pub mod error;

pub mod config;
pub mod logger;
pub mod object;
pub mod percpu;
pub mod scheduler;
pub mod score;
pub mod thread;
pub mod watchdog;

pub use config::ScoreConfig;
pub use error::{InternalError, ScoreError, ScoreResult};
pub use object::{ObjectApi, ObjectId, ObjectRegistry, ObjectTable};
pub use percpu::{CpuIndex, PerCpu};
pub use scheduler::edf::EdfScheduler;
pub use scheduler::{Priority, SchedulerPolicy};
pub use score::{Score, ScoreStats, SharedScore};
pub use thread::states::States;
pub use thread::keys::{KeyDestructor, KeyId, KeyValue};
pub use thread::{Thread, ThreadApi, ThreadAttributes, ThreadEntry, ThreadId};
pub use watchdog::{DeltaChain, Interval, Ticks, TimerSource, WatchdogToken};
