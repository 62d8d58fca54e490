//! # Rate limiter configuration.
//!
//! Buckets are configured per key class. Keys checked through
//! [`RateLimiter::allow`](crate::RateLimiter::allow), and keys of classes that
//! are not configured, use [`RateLimiterConfig::default`].
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use servevisor::{BucketConfig, RateLimiterConfig};
//!
//! let cfg = RateLimiterConfig::default()
//!     .with_class("login", BucketConfig::new(5, 0.2))
//!     .with_idle_reclaim(Duration::from_secs(600));
//!
//! assert_eq!(cfg.class("login").capacity, 5);
//! assert_eq!(cfg.class("unknown").capacity, cfg.default.capacity);
//! ```

use std::collections::HashMap;
use std::time::Duration;

/// Token-bucket parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketConfig {
    /// Burst capacity in tokens (min 1).
    pub capacity: u32,
    /// Tokens added per second of elapsed time.
    pub refill_per_sec: f64,
    /// Whether a bucket for an unseen key starts full (or empty).
    pub start_full: bool,
}

impl BucketConfig {
    /// A bucket of `capacity` tokens refilled at `refill_per_sec`, starting full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            start_full: true,
        }
    }

    /// Capacity clamped to at least one token.
    #[inline]
    pub fn capacity_clamped(&self) -> f64 {
        f64::from(self.capacity.max(1))
    }

    /// Refill rate with negative and NaN rates treated as zero.
    #[inline]
    pub fn rate(&self) -> f64 {
        if self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0 {
            self.refill_per_sec
        } else {
            0.0
        }
    }
}

impl Default for BucketConfig {
    /// 10 tokens, 1 token per second, starting full.
    fn default() -> Self {
        Self::new(10, 1.0)
    }
}

/// Settings for a [`RateLimiter`](crate::RateLimiter).
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Bucket parameters for keys without a configured class.
    pub default: BucketConfig,
    /// Bucket parameters per key class.
    pub classes: HashMap<String, BucketConfig>,
    /// Idle time after which a bucket may be reclaimed (0 = never).
    pub idle_reclaim: Duration,
}

impl Default for RateLimiterConfig {
    /// Provides a default configuration:
    /// - `default = BucketConfig::default()`
    /// - no classes
    /// - `idle_reclaim = 10min`
    fn default() -> Self {
        Self {
            default: BucketConfig::default(),
            classes: HashMap::new(),
            idle_reclaim: Duration::from_secs(600),
        }
    }
}

impl RateLimiterConfig {
    /// Adds (or replaces) a key class.
    pub fn with_class(mut self, class: impl Into<String>, bucket: BucketConfig) -> Self {
        self.classes.insert(class.into(), bucket);
        self
    }

    /// Sets the idle reclaim period.
    pub fn with_idle_reclaim(mut self, idle: Duration) -> Self {
        self.idle_reclaim = idle;
        self
    }

    /// Parameters for `class`, falling back to the default bucket.
    pub fn class(&self, class: &str) -> &BucketConfig {
        self.classes.get(class).unwrap_or(&self.default)
    }

    /// Idle reclaim period as an `Option` (`None` = never reclaim).
    #[inline]
    pub fn idle_reclaim(&self) -> Option<Duration> {
        (self.idle_reclaim > Duration::ZERO).then_some(self.idle_reclaim)
    }
}
