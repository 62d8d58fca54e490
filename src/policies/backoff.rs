//! # Respawn backoff.
//!
//! A slot that keeps dying waits `base × factor^(n-1)` before its n-th consecutive
//! respawn, clamped to `cap`. Jitter is applied to the clamped value only, so a
//! lucky short delay never drags the next one down.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use servevisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     base: Duration::from_millis(100),
//!     cap: Duration::from_secs(2),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(1), Duration::from_millis(100));
//! assert_eq!(backoff.next(2), Duration::from_millis(200));
//! assert_eq!(backoff.next(3), Duration::from_millis(400));
//! assert_eq!(backoff.next(20), Duration::from_secs(2));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Exponential respawn backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first respawn of a failure streak.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Growth per consecutive failure (`2.0` doubles).
    pub factor: f64,
    /// Randomization applied after clamping.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Fixed-delay policy (factor 1.0, no jitter).
    pub fn constant(delay: Duration) -> Self {
        Self {
            base: delay,
            cap: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before the respawn that follows `consecutive` back-to-back failures.
    ///
    /// `consecutive` is 1 for the first failure of a streak; 0 is treated as 1.
    pub fn next(&self, consecutive: u32) -> Duration {
        let exp = consecutive.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);

        let clamped = if secs.is_finite() && secs >= 0.0 && secs <= self.cap.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.cap
        };
        self.jitter.apply(clamped)
    }
}
