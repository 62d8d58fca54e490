//! Error types used by the serving core.
//!
//! Every component owns its own error enum:
//!
//! - [`ExecError`]: returned by user code (executors, worker processes).
//! - [`SupervisorError`]: raised by process supervision (capacity, startup, shutdown).
//! - [`PoolError`]: raised by the worker pool (backpressure, deadlines, faults).
//! - [`CacheError`]: raised by the single-flight cache (load failures, cancelled loads).
//! - [`RateLimited`]: admission denied by the rate limiter.
//! - [`ServeError`]: union of the above, produced by [`Pipeline`](crate::Pipeline).
//!
//! All enums provide `as_label` (stable snake_case label for logs/metrics).
//! Conditions that signal overload also carry a retry hint.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// # Errors produced by user-supplied work.
///
/// Returned by [`Executor`](crate::Executor) implementations and by
/// [`Process`](crate::Process) run loops.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Execution failed; a supervised process that returns this is respawned.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Non-recoverable error. A supervised process that returns this is quarantined.
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// Work observed its cancellation token and stopped.
    #[error("context cancelled")]
    Canceled,
}

impl ExecError {
    /// Shorthand for [`ExecError::Fail`].
    pub fn fail(error: impl fmt::Display) -> Self {
        ExecError::Fail {
            error: error.to_string(),
        }
    }

    /// Shorthand for [`ExecError::Fatal`].
    pub fn fatal(error: impl fmt::Display) -> Self {
        ExecError::Fatal {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use servevisor::ExecError;
    ///
    /// assert_eq!(ExecError::fail("boom").as_label(), "exec_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ExecError::Fail { .. } => "exec_failed",
            ExecError::Fatal { .. } => "exec_fatal",
            ExecError::Canceled => "exec_canceled",
        }
    }

    /// Indicates whether the failure is worth retrying.
    ///
    /// Only [`ExecError::Fail`] is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Fail { .. })
    }
}

/// # Errors produced by the process supervisor.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// No live process could accept the work (none ready, or every inbox full).
    #[error("no worker process has capacity; retry after {retry_after:?}")]
    NoCapacity {
        /// Suggested delay before retrying.
        retry_after: Duration,
    },

    /// Fewer than `required` processes reported ready within the startup timeout.
    #[error("startup timeout {timeout:?}: {ready}/{required} processes ready")]
    StartupTimeout {
        /// Processes that became ready in time.
        ready: usize,
        /// Processes that had to become ready.
        required: usize,
        /// The configured startup timeout.
        timeout: Duration,
    },

    /// Every slot of the pool is quarantined; only an operator reset recovers it.
    #[error("pool degraded: {quarantined} slot(s) quarantined")]
    PoolDegraded {
        /// Number of quarantined slots.
        quarantined: usize,
    },

    /// The supervisor no longer accepts work.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// `start` was called twice.
    #[error("supervisor already started")]
    AlreadyStarted,

    /// The slot index is outside the pool.
    #[error("unknown slot {slot}")]
    UnknownSlot {
        /// Offending slot index.
        slot: usize,
    },

    /// `reset` was called on a slot that is not quarantined.
    #[error("slot {slot} is not quarantined")]
    NotQuarantined {
        /// Offending slot index.
        slot: usize,
    },

    /// Drain timeout was exceeded; the listed processes were forcibly terminated.
    #[error("drain timeout {grace:?} exceeded; stuck: {stuck:?}; forced termination")]
    GraceExceeded {
        /// The drain timeout.
        grace: Duration,
        /// Processes that did not stop in time.
        stuck: Vec<String>,
    },
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::NoCapacity { .. } => "supervisor_no_capacity",
            SupervisorError::StartupTimeout { .. } => "supervisor_startup_timeout",
            SupervisorError::PoolDegraded { .. } => "supervisor_pool_degraded",
            SupervisorError::ShuttingDown => "supervisor_shutting_down",
            SupervisorError::AlreadyStarted => "supervisor_already_started",
            SupervisorError::UnknownSlot { .. } => "supervisor_unknown_slot",
            SupervisorError::NotQuarantined { .. } => "supervisor_not_quarantined",
            SupervisorError::GraceExceeded { .. } => "supervisor_grace_exceeded",
        }
    }

    /// Suggested retry delay, where one applies.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            SupervisorError::NoCapacity { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Work handed back to the caller of [`Supervisor::dispatch`](crate::Supervisor::dispatch).
///
/// Dispatch never drops work: on failure the caller gets it back along with the reason.
pub struct Rejected<W> {
    /// The work that could not be forwarded.
    pub work: W,
    /// Why it was rejected.
    pub error: SupervisorError,
}

impl<W> Rejected<W> {
    pub(crate) fn new(work: W, error: SupervisorError) -> Self {
        Self { work, error }
    }

    /// Discards the work and keeps the reason.
    pub fn into_error(self) -> SupervisorError {
        self.error
    }
}

impl<W> fmt::Debug for Rejected<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<W> fmt::Display for Rejected<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch rejected: {}", self.error)
    }
}

impl<W> StdError for Rejected<W> {}

/// # Errors produced by the worker pool.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The queue is at its configured depth (backpressure).
    #[error("queue full at depth {depth}; retry after {retry_after:?}")]
    QueueFull {
        /// Configured maximum queue depth.
        depth: usize,
        /// Suggested delay before resubmitting.
        retry_after: Duration,
    },

    /// The task deadline elapsed before a result was produced.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The executor returned an error or panicked.
    #[error("task failed: {error}")]
    Failed {
        /// Fault detail.
        error: String,
    },

    /// The task was cancelled before it completed.
    #[error("task cancelled")]
    Cancelled,

    /// The pool has been shut down.
    #[error("worker pool closed")]
    Closed,
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::QueueFull { .. } => "pool_queue_full",
            PoolError::DeadlineExceeded => "pool_deadline_exceeded",
            PoolError::Failed { .. } => "pool_task_failed",
            PoolError::Cancelled => "pool_task_cancelled",
            PoolError::Closed => "pool_closed",
        }
    }

    /// Suggested retry delay, where one applies.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            PoolError::QueueFull { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// # Errors produced by the cache.
///
/// Failures are never memoized: the next caller for the key triggers a new load.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The loader returned an error (or panicked). Shared by every waiter of that load.
    #[error("load failed for key {key}: {cause}")]
    LoadFailed {
        /// Debug rendering of the key.
        key: String,
        /// Error returned by the loader.
        cause: Arc<dyn StdError + Send + Sync>,
    },

    /// The in-flight load was aborted by `invalidate`.
    #[error("load for key {key} cancelled by invalidation")]
    Cancelled {
        /// Debug rendering of the key.
        key: String,
    },

    /// The caller's wait bound elapsed before the load completed.
    #[error("wait for key {key} exceeded its deadline")]
    DeadlineExceeded {
        /// Debug rendering of the key.
        key: String,
    },
}

impl CacheError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CacheError::LoadFailed { .. } => "cache_load_failed",
            CacheError::Cancelled { .. } => "cache_load_cancelled",
            CacheError::DeadlineExceeded { .. } => "cache_deadline_exceeded",
        }
    }

    /// Returns the loader's error if it is of type `T`.
    pub fn cause_as<T: StdError + 'static>(&self) -> Option<&T> {
        match self {
            CacheError::LoadFailed { cause, .. } => cause.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// Admission denied by the [`RateLimiter`](crate::RateLimiter).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rate limited: key {key}, retry after {retry_after:?}")]
pub struct RateLimited {
    /// Caller key that was denied.
    pub key: String,
    /// Instant at which a token becomes available.
    pub reset_at: Instant,
    /// `reset_at` relative to the decision time.
    pub retry_after: Duration,
}

/// # Any condition the serving core surfaces to a request flow.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ServeError {
    /// Admission denied.
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    /// The cache could not produce a value.
    #[error(transparent)]
    Cache(CacheError),

    /// The worker pool rejected or failed the work.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The supervisor could not route the work.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl From<CacheError> for ServeError {
    /// Unwraps pool failures that travelled through a cache loader so callers can
    /// branch on the typed condition (`QueueFull`, `DeadlineExceeded`, ...).
    fn from(err: CacheError) -> Self {
        match err.cause_as::<PoolError>() {
            Some(pool) => ServeError::Pool(pool.clone()),
            None => ServeError::Cache(err),
        }
    }
}

impl ServeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServeError::RateLimited(_) => "rate_limited",
            ServeError::Cache(e) => e.as_label(),
            ServeError::Pool(e) => e.as_label(),
            ServeError::Supervisor(e) => e.as_label(),
        }
    }

    /// Suggested retry delay for overload conditions.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ServeError::RateLimited(e) => Some(e.retry_after),
            ServeError::Pool(e) => e.retry_hint(),
            ServeError::Supervisor(e) => e.retry_hint(),
            ServeError::Cache(_) => None,
        }
    }
}

/// Renders a caught panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
