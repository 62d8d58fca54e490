//! # Cache configuration.
//!
//! ## Sentinel values
//! - `stale_window = 0s` → expired entries are never served stale
//! - `max_entries = 0` → no entry ceiling (no LRU eviction)

use std::time::Duration;

/// Settings for a [`Cache`](crate::Cache).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// TTL used when a call passes `None`.
    pub default_ttl: Duration,
    /// How long past its TTL an entry may still be served by stale-while-revalidate
    /// reads (and kept before sweeping), unless the call passes its own window.
    pub stale_window: Duration,
    /// Ceiling on stored values (a key with only a load in flight does not count).
    /// Beyond it expired entries are evicted first, then the least recently accessed.
    pub max_entries: usize,
    /// If `true`, `invalidate` aborts the key's in-flight load and its waiters get
    /// [`CacheError::Cancelled`](crate::CacheError::Cancelled). If `false`, the load
    /// completes and repopulates the entry.
    pub cancel_in_flight_on_invalidate: bool,
}

impl Default for CacheConfig {
    /// Provides a default configuration:
    /// - `default_ttl = 60s`
    /// - `stale_window = 0s` (disabled)
    /// - `max_entries = 0` (unbounded)
    /// - `cancel_in_flight_on_invalidate = false`
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            stale_window: Duration::ZERO,
            max_entries: 0,
            cancel_in_flight_on_invalidate: false,
        }
    }
}
