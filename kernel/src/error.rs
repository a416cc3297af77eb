//! Score Error Handling
//!
//! Two kinds of failure leave the core:
//! - [`ScoreError`]: recoverable conditions reported to the API layer
//!   (pool exhaustion, bad handles, wrong thread state).
//! - [`InternalError`]: broken invariants. These go through [`fatal`] and
//!   never return, since continuing would corrupt shared structures.

use core::fmt;

use crate::object::ObjectId;
use crate::thread::keys::KeyId;
use crate::thread::states::States;

/// Recoverable errors surfaced to callers of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreError {
    // ═══════════════════════════════════════════════════════════════
    // Resource exhaustion
    // ═══════════════════════════════════════════════════════════════
    /// Every thread control block of the pool is in use
    ThreadPoolExhausted { maximum: usize },

    /// The scheduler has no per-thread payload left
    SchedulerPoolExhausted { capacity: usize },

    /// The object registry has no free identifier
    IdsExhausted,

    /// Every per-thread storage key is in use
    KeysExhausted { maximum: usize },

    // ═══════════════════════════════════════════════════════════════
    // Caller errors
    // ═══════════════════════════════════════════════════════════════
    /// No thread with this identifier exists
    InvalidId { id: ObjectId },

    /// The thread is in the wrong state for the requested operation
    IncorrectState { id: ObjectId, state: States },

    /// No per-thread storage key with this identifier exists
    InvalidKey { key: KeyId },

    /// Extension slot outside of the configured range
    InvalidExtensionSlot { slot: usize, count: usize },

    /// Processor index outside of the configured range
    InvalidProcessor { index: usize, count: usize },

    /// Configuration rejected at construction time
    InvalidConfiguration { reason: &'static str },
}

impl fmt::Display for ScoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadPoolExhausted { maximum } => {
                write!(f, "Thread pool exhausted ({} control blocks)", maximum)
            }
            Self::SchedulerPoolExhausted { capacity } => {
                write!(f, "Scheduler payload pool exhausted ({} nodes)", capacity)
            }
            Self::IdsExhausted => write!(f, "No free object identifier"),
            Self::KeysExhausted { maximum } => {
                write!(f, "Key table exhausted ({} keys)", maximum)
            }
            Self::InvalidId { id } => write!(f, "Invalid thread id {}", id),
            Self::IncorrectState { id, state } => {
                write!(f, "Thread {} in incorrect state {}", id, state)
            }
            Self::InvalidKey { key } => write!(f, "Invalid key {}", key),
            Self::InvalidExtensionSlot { slot, count } => {
                write!(f, "Extension slot {} out of range (0..{})", slot, count)
            }
            Self::InvalidProcessor { index, count } => {
                write!(f, "Processor {} out of range (0..{})", index, count)
            }
            Self::InvalidConfiguration { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }
        }
    }
}

impl ScoreError {
    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::ThreadPoolExhausted { .. } => "Delete threads or raise maximum_threads",
            Self::SchedulerPoolExhausted { .. } => "Raise the scheduler node capacity",
            Self::IdsExhausted => "Free objects or enlarge the registry",
            Self::KeysExhausted { .. } => "Delete keys or raise maximum_keys",
            Self::InvalidId { .. } => "Thread may have already terminated",
            Self::IncorrectState { .. } => "Check thread lifecycle management",
            Self::InvalidConfiguration { .. } => "Fix the configuration table",
            _ => "Check the caller arguments",
        }
    }

    /// Is this a recoverable error?
    ///
    /// Configuration errors are only seen at boot and leave nothing to
    /// recover; everything else can be retried or reported to the user.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidConfiguration { .. })
    }
}

/// Result type for score operations
pub type ScoreResult<T> = Result<T, ScoreError>;

/// Broken invariants. Reported through [`fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalError {
    /// `block` was called with a queue that does not exist
    BlockWithoutQueue,
    /// `block` was called on a thread that is not ready
    BlockNonReadyThread,
    /// A post-switch action was added with interrupts enabled
    ActionAddWithInterruptsEnabled,
    /// Ready set size and ready thread count disagree
    ReadySetMismatch { ready_set: usize, ready_threads: usize },
    /// Internal reference to a thread that is not in the pool
    UnknownThread,
    /// Internal reference to a thread queue that does not exist
    UnknownQueue,
    /// A thread queue was created with a non-waiting blocking state
    InvalidQueueState,
    /// The scheduler was handed a thread it did not allocate
    SchedulerPayloadMissing,
    /// The scheduler payload was allocated twice for one thread
    SchedulerPayloadAllocatedTwice,
    /// ISR enable with a level that does not match the last disable
    IsrLevelMismatch,
    /// Operation on a processor that is not up
    ProcessorNotUp,
    /// Life protection changed while no thread is executing
    NoExecutingThread,
    /// Resource released more often than acquired
    ResourceCountUnderflow,
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadySetMismatch { ready_set, ready_threads } => write!(
                f,
                "ready set holds {} threads but {} are ready",
                ready_set, ready_threads
            ),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Terminate on a broken invariant
#[cold]
pub fn fatal(error: InternalError) -> ! {
    log::error!("[SCORE] fatal: {}", error);
    panic!("[SCORE FATAL] {}", error);
}

/// Macro for critical score assertions
#[macro_export]
macro_rules! score_assert {
    ($cond:expr, $error:expr) => {
        if !$cond {
            $crate::error::fatal($error);
        }
    };
}
