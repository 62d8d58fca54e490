//! Per-key cache state: the stored value and the in-flight load marker.

use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::CacheError;

/// Future every waiter of one load polls; resolves once for all of them.
pub(crate) type LoadFuture<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

/// A stored value.
pub(crate) struct Entry<V> {
    pub(crate) value: V,
    pub(crate) expires_at: Instant,
    /// Past this instant the entry is dead, even for stale reads.
    pub(crate) stale_until: Instant,
    /// Access tick for LRU ordering.
    pub(crate) last_access: u64,
}

impl<V> Entry<V> {
    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub(crate) fn is_stale_within(&self, now: Instant, window: Duration) -> bool {
        !self.is_fresh(now) && now < later(self.expires_at, window) && now < self.stale_until
    }

    pub(crate) fn is_dead(&self, now: Instant) -> bool {
        now >= self.stale_until
    }
}

/// The in-flight load for a key.
pub(crate) struct Flight<V> {
    /// Only the flight whose id is still installed may store its result.
    pub(crate) id: u64,
    pub(crate) fut: LoadFuture<V>,
    pub(crate) abort: AbortHandle,
}

pub(crate) struct Slot<V> {
    pub(crate) entry: Option<Entry<V>>,
    pub(crate) flight: Option<Flight<V>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            entry: None,
            flight: None,
        }
    }
}

impl<V> Slot<V> {
    pub(crate) fn is_vacant(&self) -> bool {
        self.entry.is_none() && self.flight.is_none()
    }
}

/// `at + d`, saturating far in the future instead of overflowing.
pub(crate) fn later(at: Instant, d: Duration) -> Instant {
    at.checked_add(d)
        .unwrap_or_else(|| at + Duration::from_secs(100 * 365 * 24 * 3600))
}
