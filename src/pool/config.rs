//! # Worker pool configuration.
//!
//! ## Sentinel values
//! - `max_queue_depth = 0` → queue is unbounded
//! - `default_deadline = 0s` → tasks submitted without a deadline never expire
//! - `retention = 0s` → no background sweep; a finished task is forgotten once its
//!   handle has been dropped

use std::time::Duration;

/// Settings for a [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Execution slots: the bound on concurrently running tasks (min 1).
    pub slots: usize,
    /// Maximum number of queued tasks before `submit` fails with `QueueFull`.
    pub max_queue_depth: usize,
    /// Deadline applied when `submit` is called without one.
    pub default_deadline: Duration,
    /// How long finished, unobserved tasks stay queryable through `status`.
    pub retention: Duration,
    /// Retry hint attached to `QueueFull`.
    pub queue_full_retry_after: Duration,
}

impl Default for PoolConfig {
    /// Provides a default configuration:
    /// - `slots` = available parallelism (4 if unknown)
    /// - `max_queue_depth = 1024`
    /// - `default_deadline = 0s` (none)
    /// - `retention = 60s`
    /// - `queue_full_retry_after = 50ms`
    fn default() -> Self {
        Self {
            slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_queue_depth: 1024,
            default_deadline: Duration::ZERO,
            retention: Duration::from_secs(60),
            queue_full_retry_after: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    /// Slot count clamped to at least 1.
    #[inline]
    pub fn slots_clamped(&self) -> usize {
        self.slots.max(1)
    }

    /// Default deadline as an `Option` (`None` = no deadline).
    #[inline]
    pub fn default_deadline(&self) -> Option<Duration> {
        (self.default_deadline > Duration::ZERO).then_some(self.default_deadline)
    }

    /// Retention as an `Option` (`None` = no background sweep).
    #[inline]
    pub fn retention(&self) -> Option<Duration> {
        (self.retention > Duration::ZERO).then_some(self.retention)
    }
}
