//! # Global configuration.
//!
//! [`Config`] bundles the settings of every component plus the event bus
//! capacity. Each section is a plain struct with a `Default`; override only
//! what you need.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use servevisor::{BucketConfig, Config};
//!
//! let mut cfg = Config::default();
//! cfg.supervisor.pool_size = 8;
//! cfg.supervisor.min_ready = 6;
//! cfg.pool.max_queue_depth = 256;
//! cfg.cache.default_ttl = Duration::from_secs(30);
//! cfg.cache.stale_window = Duration::from_secs(120);
//! cfg.limiter = cfg.limiter.with_class("login", BucketConfig::new(5, 0.1));
//!
//! assert_eq!(cfg.supervisor.pool_size, 8);
//! assert_eq!(cfg.bus().subscribe().len(), 0);
//! ```

use crate::cache::CacheConfig;
use crate::events::Bus;
use crate::limiter::RateLimiterConfig;
use crate::pool::PoolConfig;
use crate::supervisor::SupervisorConfig;

/// Settings for the whole serving core.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
    /// Process supervision.
    pub supervisor: SupervisorConfig,
    /// Worker pool.
    pub pool: PoolConfig,
    /// Single-flight cache.
    pub cache: CacheConfig,
    /// Admission control.
    pub limiter: RateLimiterConfig,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `bus_capacity = 1024`
    /// - every section at its own default
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            supervisor: SupervisorConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            limiter: RateLimiterConfig::default(),
        }
    }
}

impl Config {
    /// A new event bus with the configured capacity.
    pub fn bus(&self) -> Bus {
        Bus::new(self.bus_capacity)
    }
}
