//! # Supervisor configuration.
//!
//! ## Sentinel values
//! - `heartbeat_timeout = 0s` → liveness of ready processes is not checked
//! - `ready_timeout = 0s` → a launched process may stay `Starting` indefinitely
//! - `reset_after = 0s` → the failure streak is never forgiven

use std::time::Duration;

use crate::policies::{BackoffPolicy, RestartCeiling};

/// Settings for a [`Supervisor`](crate::Supervisor).
///
/// `pool_size`, `min_ready` and `startup_timeout` are the defaults used by
/// [`Supervisor::launch`](crate::Supervisor::launch); [`Supervisor::start`](crate::Supervisor::start)
/// takes them as arguments.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Number of process slots.
    pub pool_size: usize,
    /// Processes that must be ready before `launch` returns.
    pub min_ready: usize,
    /// How long `launch` waits for `min_ready` processes.
    pub startup_timeout: Duration,
    /// Capacity of every process inbox (min 1).
    pub inbox_capacity: usize,
    /// Respawn delay growth.
    pub backoff: BackoffPolicy,
    /// Uptime after which a process is considered healthy and its failure streak resets.
    pub reset_after: Duration,
    /// Restart ceiling that quarantines a crash-looping slot.
    pub ceiling: RestartCeiling,
    /// Maximum silence before a ready process is considered hung.
    pub heartbeat_timeout: Duration,
    /// How long a launched (or respawned) process may take to report ready
    /// before it is killed with reason `startup_timeout`.
    pub ready_timeout: Duration,
    /// Default drain timeout for [`Supervisor::run_until_signal`](crate::Supervisor::run_until_signal).
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            min_ready: 1,
            startup_timeout: Duration::from_secs(10),
            inbox_capacity: 64,
            backoff: BackoffPolicy::default(),
            reset_after: Duration::from_secs(30),
            ceiling: RestartCeiling::default(),
            heartbeat_timeout: Duration::ZERO,
            ready_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Heartbeat timeout as an `Option` (`None` = not checked).
    #[inline]
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout > Duration::ZERO).then_some(self.heartbeat_timeout)
    }

    /// Readiness deadline as an `Option` (`None` = not checked).
    #[inline]
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout > Duration::ZERO).then_some(self.ready_timeout)
    }

    /// Period of the liveness check: half the shortest enabled deadline.
    pub(crate) fn liveness_period(&self) -> Option<Duration> {
        let shortest = match (self.heartbeat_timeout(), self.ready_timeout()) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        Some((shortest / 2).max(Duration::from_millis(1)))
    }

    /// Healthy-uptime threshold as an `Option` (`None` = never reset).
    #[inline]
    pub fn reset_after(&self) -> Option<Duration> {
        (self.reset_after > Duration::ZERO).then_some(self.reset_after)
    }

    /// Inbox capacity clamped to at least 1.
    #[inline]
    pub fn inbox_capacity_clamped(&self) -> usize {
        self.inbox_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let mut cfg = SupervisorConfig::default();
        assert_eq!(cfg.heartbeat_timeout(), None);
        assert_eq!(cfg.ready_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.liveness_period(), Some(Duration::from_secs(15)));
        assert_eq!(cfg.reset_after(), Some(Duration::from_secs(30)));

        cfg.heartbeat_timeout = Duration::from_secs(2);
        cfg.reset_after = Duration::ZERO;
        cfg.inbox_capacity = 0;
        assert_eq!(cfg.heartbeat_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(cfg.liveness_period(), Some(Duration::from_secs(1)));
        assert_eq!(cfg.reset_after(), None);
        assert_eq!(cfg.inbox_capacity_clamped(), 1);

        cfg.heartbeat_timeout = Duration::ZERO;
        cfg.ready_timeout = Duration::ZERO;
        assert_eq!(cfg.ready_timeout(), None);
        assert_eq!(cfg.liveness_period(), None);
    }
}
