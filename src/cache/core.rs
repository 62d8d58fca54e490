//! # Single-flight TTL cache.
//!
//! ## Architecture
//! ```text
//! get_or_load(key, ttl, loader)
//!   ├─ fresh entry                 → value                         (hit)
//!   ├─ flight in progress          → await its shared future       (coalesced miss)
//!   └─ otherwise                   → install flight, spawn loader  (leader miss)
//!                                       │
//!                                       ▼
//!                          loader finishes (or panics)
//!                            ├─ Ok   → entry { expires_at = now + ttl }, flight cleared
//!                            └─ Err  → flight cleared, nothing stored; every waiter gets LoadFailed
//! ```
//!
//! Per-key state lives in a sharded map; a shard lock is only held for the
//! synchronous bookkeeping, never across an await. The loader runs on its own
//! tokio task, so a waiter that gives up (timeout, dropped future) does not
//! cancel the load for everybody else.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use servevisor::{Cache, CacheConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), servevisor::CacheError> {
//!     let cache: Cache<String, u64> = Cache::new(CacheConfig::default());
//!
//!     let v = cache
//!         .get_or_load("answer".to_string(), Some(Duration::from_secs(30)), || async {
//!             Ok::<_, std::io::Error>(42)
//!         })
//!         .await?;
//!     assert_eq!(v, 42);
//!     assert_eq!(cache.get(&"answer".to_string()), Some(42));
//!     Ok(())
//! }
//! ```

use std::error::Error as StdError;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::config::CacheConfig;
use crate::cache::entry::{Entry, Flight, LoadFuture, Slot, later};
use crate::error::{CacheError, panic_message};

/// Cause attached to [`CacheError::LoadFailed`] when the loader panicked.
#[derive(Debug, Error)]
#[error("loader panicked: {0}")]
pub struct LoaderPanicked(pub String);

/// How a value returned by [`Cache::get_stale_while_revalidate`] was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// Within its TTL.
    Fresh,
    /// Past its TTL but inside the stale window; a refresh is in progress.
    Stale,
    /// Loaded for this call (the key was missing or too old to serve).
    Loaded,
}

/// A value plus how it was obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cached<V> {
    /// The value.
    pub value: V,
    /// Fresh, stale or just loaded.
    pub freshness: Freshness,
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from a fresh entry.
    pub hits: u64,
    /// Reads that had to wait for a load.
    pub misses: u64,
    /// Stale values served by stale-while-revalidate reads.
    pub stale_served: u64,
    /// Loads started.
    pub loads: u64,
    /// Loads that failed (loader error or panic).
    pub load_failures: u64,
    /// Entries evicted by the entry ceiling.
    pub evictions: u64,
    /// Entries dropped after their stale window.
    pub expirations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Loading(LoadFuture<V>),
    Miss,
}

struct Inner<K, V> {
    cfg: CacheConfig,
    slots: DashMap<K, Slot<V>>,
    /// Slots holding a value; a slot with only a load in flight is not counted.
    stored: AtomicUsize,
    tick: AtomicU64,
    flights: AtomicU64,
    counters: Counters,
}

/// Key-addressed value store with loader-on-miss and stampede protection.
///
/// Cheap to clone; clones share the same entries.
pub struct Cache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache.
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                slots: DashMap::new(),
                stored: AtomicUsize::new(0),
                tick: AtomicU64::new(0),
                flights: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Cache settings.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.cfg
    }

    /// Returns the fresh value for `key`, loading it at most once across concurrent callers.
    ///
    /// `ttl = None` uses the configured default. `loader` is invoked only by the
    /// caller that starts the load; it must not call back into this cache
    /// synchronously (the future it returns may).
    ///
    /// # Errors
    /// - [`CacheError::LoadFailed`] if the loader failed or panicked; nothing is stored
    ///   and every waiter of that load receives the same error.
    /// - [`CacheError::Cancelled`] if the load was aborted by `invalidate`.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let fut = match self.lookup(&key, Duration::ZERO) {
            Lookup::Fresh(value) => {
                Counters::bump(&self.inner.counters.hits);
                return Ok(value);
            }
            Lookup::Loading(fut) => fut,
            Lookup::Stale(_) | Lookup::Miss => self.launch(key, ttl, Duration::ZERO, loader),
        };
        Counters::bump(&self.inner.counters.misses);
        fut.await
    }

    /// [`get_or_load`](Self::get_or_load) with a bound on how long this caller waits.
    ///
    /// On timeout the caller gets [`CacheError::DeadlineExceeded`]; the load itself
    /// keeps running and still populates the entry.
    pub async fn get_or_load_within<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        wait: Duration,
        loader: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let label = key.clone();
        tokio::time::timeout(wait, self.get_or_load(key, ttl, loader))
            .await
            .unwrap_or_else(|_| {
                Err(CacheError::DeadlineExceeded {
                    key: format!("{label:?}"),
                })
            })
    }

    /// Stale-while-revalidate read.
    ///
    /// A fresh entry is returned as [`Freshness::Fresh`]. An entry past its TTL but
    /// inside `stale_window` (`None` = configured window) is returned immediately as
    /// [`Freshness::Stale`] and exactly one background refresh is started. Anything
    /// older is loaded like [`get_or_load`](Self::get_or_load) and returned as
    /// [`Freshness::Loaded`].
    pub async fn get_stale_while_revalidate<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        stale_window: Option<Duration>,
        loader: F,
    ) -> Result<Cached<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let window = stale_window.unwrap_or(self.inner.cfg.stale_window);
        let fut = match self.lookup(&key, window) {
            Lookup::Fresh(value) => {
                Counters::bump(&self.inner.counters.hits);
                return Ok(Cached {
                    value,
                    freshness: Freshness::Fresh,
                });
            }
            Lookup::Stale(value) => {
                Counters::bump(&self.inner.counters.stale_served);
                // Joins the refresh already in flight, if any.
                drop(self.launch(key, ttl, window, loader));
                return Ok(Cached {
                    value,
                    freshness: Freshness::Stale,
                });
            }
            Lookup::Loading(fut) => fut,
            Lookup::Miss => self.launch(key, ttl, window, loader),
        };
        Counters::bump(&self.inner.counters.misses);
        fut.await.map(|value| Cached {
            value,
            freshness: Freshness::Loaded,
        })
    }

    /// Fresh value for `key`, if any. Never loads.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let tick = self.inner.next_tick();
        let mut slot = self.inner.slots.get_mut(key)?;
        let entry = slot.entry.as_mut().filter(|e| e.is_fresh(now))?;
        entry.last_access = tick;
        Some(entry.value.clone())
    }

    /// Stores `value` directly. A load in flight for `key` still stores its own
    /// result when it completes.
    pub fn insert(&self, key: K, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.cfg.default_ttl);
        self.inner.store(key, value, ttl, Duration::ZERO);
        self.inner.enforce_capacity();
    }

    /// Removes the entry for `key`. Returns `true` if a stored value was removed
    /// (or, in cancelling mode, a load was aborted).
    ///
    /// An in-flight load is left running (and repopulates the entry) unless
    /// `cancel_in_flight_on_invalidate` is set.
    pub fn invalidate(&self, key: &K) -> bool {
        if self.inner.cfg.cancel_in_flight_on_invalidate {
            let Some((_, slot)) = self.inner.slots.remove(key) else {
                return false;
            };
            if slot.entry.is_some() {
                self.inner.unstored(1);
            }
            if let Some(flight) = slot.flight {
                tracing::debug!(?key, "invalidate aborted in-flight load");
                flight.abort.abort();
            }
            return true;
        }

        let removed = match self.inner.slots.get_mut(key) {
            Some(mut slot) => slot.entry.take().is_some(),
            None => return false,
        };
        if removed {
            self.inner.unstored(1);
        }
        self.inner.slots.remove_if(key, |_, s| s.is_vacant());
        removed
    }

    /// Drops entries past their stale window; returns how many.
    pub fn sweep(&self) -> usize {
        self.inner.purge_dead(Instant::now())
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let swept = cache.sweep();
                        if swept > 0 {
                            tracing::trace!(swept, "cache sweep");
                        }
                    }
                }
            }
        })
    }

    /// Number of stored values (fresh or not yet swept).
    pub fn len(&self) -> usize {
        self.inner.stored.load(Ordering::Relaxed)
    }

    /// True if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &K, stale_window: Duration) -> Lookup<V> {
        let now = Instant::now();
        let tick = self.inner.next_tick();
        let found = {
            let Some(mut guard) = self.inner.slots.get_mut(key) else {
                return Lookup::Miss;
            };
            let slot = &mut *guard;
            if let Some(entry) = slot.entry.as_mut() {
                if entry.is_fresh(now) {
                    entry.last_access = tick;
                    return Lookup::Fresh(entry.value.clone());
                }
                if entry.is_stale_within(now, stale_window) {
                    entry.last_access = tick;
                    return Lookup::Stale(entry.value.clone());
                }
            }
            if slot.entry.as_ref().is_some_and(|e| e.is_dead(now)) {
                slot.entry = None;
                self.inner.unstored(1);
                Counters::bump(&self.inner.counters.expirations);
            }
            match &slot.flight {
                Some(flight) => Lookup::Loading(flight.fut.clone()),
                None => Lookup::Miss,
            }
        };
        self.inner.slots.remove_if(key, |_, s| s.is_vacant());
        found
    }

    /// Installs a flight for `key` unless one already exists; returns the shared future.
    fn launch<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        keep: Duration,
        loader: F,
    ) -> LoadFuture<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let ttl = ttl.unwrap_or(self.inner.cfg.default_ttl);
        let keep = keep.max(self.inner.cfg.stale_window);

        let mut slot = self.inner.slots.entry(key.clone()).or_default();
        if let Some(flight) = &slot.flight {
            return flight.fut.clone();
        }
        if let Some(entry) = slot.entry.as_ref().filter(|e| e.is_fresh(Instant::now())) {
            // Another caller stored a value between our lookup and now.
            return futures::future::ready(Ok(entry.value.clone()))
                .boxed()
                .shared();
        }

        let id = self.inner.flights.fetch_add(1, Ordering::Relaxed);
        let load = loader();
        let inner = Arc::clone(&self.inner);
        let owned = key.clone();
        let handle = tokio::spawn(async move {
            let res = match AssertUnwindSafe(load).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CacheError::LoadFailed {
                    key: format!("{owned:?}"),
                    cause: Arc::new(e),
                }),
                Err(panic) => Err(CacheError::LoadFailed {
                    key: format!("{owned:?}"),
                    cause: Arc::new(LoaderPanicked(panic_message(&*panic))),
                }),
            };
            inner.complete(owned, id, ttl, keep, &res);
            res
        });

        let abort = handle.abort_handle();
        let label = format!("{key:?}");
        let fut = handle
            .map(move |joined| {
                joined.unwrap_or_else(|_| Err(CacheError::Cancelled { key: label }))
            })
            .boxed()
            .shared();
        slot.flight = Some(Flight {
            id,
            fut: fut.clone(),
            abort,
        });
        Counters::bump(&self.inner.counters.loads);
        tracing::trace!(?key, flight = id, "cache load started");
        fut
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Publishes the result of flight `id`, unless it was superseded or cancelled.
    fn complete(&self, key: K, id: u64, ttl: Duration, keep: Duration, res: &Result<V, CacheError>) {
        {
            let Some(mut slot) = self.slots.get_mut(&key) else {
                return;
            };
            if slot.flight.as_ref().map(|f| f.id) != Some(id) {
                return;
            }
            slot.flight = None;
        }
        match res {
            Ok(value) => {
                self.store(key, value.clone(), ttl, keep);
                self.enforce_capacity();
            }
            Err(e) => {
                Counters::bump(&self.counters.load_failures);
                tracing::debug!(?key, error = %e, "cache load failed");
                self.slots.remove_if(&key, |_, s| s.is_vacant());
            }
        }
    }

    fn store(&self, key: K, value: V, ttl: Duration, keep: Duration) {
        let now = Instant::now();
        let expires_at = later(now, ttl);
        let entry = Entry {
            value,
            expires_at,
            stale_until: later(expires_at, keep.max(self.cfg.stale_window)),
            last_access: self.next_tick(),
        };
        let mut slot = self.slots.entry(key).or_default();
        if slot.entry.replace(entry).is_none() {
            self.stored.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn unstored(&self, n: usize) {
        self.stored.fetch_sub(n, Ordering::Relaxed);
    }

    fn purge_dead(&self, now: Instant) -> usize {
        let mut dead = 0;
        self.slots.retain(|_, slot| {
            if slot.entry.as_ref().is_some_and(|e| e.is_dead(now)) {
                slot.entry = None;
                dead += 1;
            }
            !slot.is_vacant()
        });
        self.unstored(dead);
        self.counters
            .expirations
            .fetch_add(dead as u64, Ordering::Relaxed);
        dead
    }

    /// Applies the entry ceiling to stored values: dead entries are purged,
    /// then expired entries go before fresh ones, least recently accessed first.
    /// A load in flight keeps running when its slot's old value is evicted.
    fn enforce_capacity(&self) {
        let max = self.cfg.max_entries;
        if max == 0 || self.stored.load(Ordering::Relaxed) <= max {
            return;
        }
        let now = Instant::now();
        self.purge_dead(now);

        while self.stored.load(Ordering::Relaxed) > max {
            let victim = self
                .slots
                .iter()
                .filter_map(|s| {
                    s.entry
                        .as_ref()
                        .map(|e| (s.key().clone(), e.is_fresh(now), e.last_access))
                })
                .min_by_key(|(_, fresh, tick)| (*fresh, *tick));
            let Some((key, _, tick)) = victim else {
                break;
            };
            let evicted = match self.slots.get_mut(&key) {
                Some(mut slot) if slot.entry.as_ref().is_some_and(|e| e.last_access == tick) => {
                    slot.entry.take().is_some()
                }
                _ => false,
            };
            if evicted {
                self.unstored(1);
                self.slots.remove_if(&key, |_, s| s.is_vacant());
                Counters::bump(&self.counters.evictions);
                tracing::trace!(?key, "cache entry evicted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    fn cache(cfg: CacheConfig) -> Cache<&'static str, u32> {
        Cache::new(cfg)
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        value: u32,
        delay: Duration,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<u32, io::Error>> + use<> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_load() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let c = c.clone();
                let loader = counted(&calls, 7, Duration::from_millis(50));
                tokio::spawn(async move { c.get_or_load("k", None, loader).await })
            })
            .collect();
        for w in waiters {
            assert_eq!(w.await.unwrap().unwrap(), 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = c.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.misses, 10);
        assert_eq!(c.get(&"k"), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_shared_and_not_memoized() {
        let c = cache(CacheConfig::default());
        let failing = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(io::Error::other("backend down"))
        };

        let (a, b) = tokio::join!(
            c.get_or_load("k", None, failing),
            c.get_or_load("k", None, failing)
        );
        for res in [a, b] {
            let err = res.unwrap_err();
            assert_eq!(err.as_label(), "cache_load_failed");
            assert!(err.cause_as::<io::Error>().is_some());
        }
        assert_eq!(c.stats().loads, 1);
        assert_eq!(c.len(), 0);

        let calls = Arc::new(AtomicUsize::new(0));
        let v = c
            .get_or_load("k", None, counted(&calls, 3, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_reloads() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(1));

        assert_eq!(c.get_or_load("k", ttl, counted(&calls, 1, Duration::ZERO)).await.unwrap(), 1);
        assert_eq!(c.get_or_load("k", ttl, counted(&calls, 2, Duration::ZERO)).await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(c.get(&"k"), None);
        assert_eq!(c.get_or_load("k", ttl, counted(&calls, 2, Duration::ZERO)).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_refreshes_once() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(1));
        let window = Some(Duration::from_secs(5));

        let first = c
            .get_stale_while_revalidate("k", ttl, window, counted(&calls, 1, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(first.freshness, Freshness::Loaded);

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..3 {
            let stale = c
                .get_stale_while_revalidate("k", ttl, window, counted(&calls, 2, Duration::from_millis(100)))
                .await
                .unwrap();
            assert_eq!(stale, Cached { value: 1, freshness: Freshness::Stale });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = c
            .get_stale_while_revalidate("k", ttl, window, counted(&calls, 3, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(fresh, Cached { value: 2, freshness: Freshness::Fresh });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.stats().stale_served, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_old_for_window_is_loaded() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(1));
        let window = Some(Duration::from_secs(1));

        c.get_stale_while_revalidate("k", ttl, window, counted(&calls, 1, Duration::ZERO))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let got = c
            .get_stale_while_revalidate("k", ttl, window, counted(&calls, 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got, Cached { value: 2, freshness: Freshness::Loaded });
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_lets_load_repopulate() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let c = c.clone();
            let loader = counted(&calls, 9, Duration::from_millis(50));
            tokio::spawn(async move { c.get_or_load("k", None, loader).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!c.invalidate(&"k"), "nothing stored yet");

        assert_eq!(waiter.await.unwrap().unwrap(), 9);
        assert_eq!(c.get(&"k"), Some(9));
        assert!(c.invalidate(&"k"));
        assert_eq!(c.get(&"k"), None);
        assert!(!c.invalidate(&"k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_can_cancel_load() {
        let c = cache(CacheConfig {
            cancel_in_flight_on_invalidate: true,
            ..CacheConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let c = c.clone();
            let loader = counted(&calls, 9, Duration::from_millis(50));
            tokio::spawn(async move { c.get_or_load("k", None, loader).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(c.invalidate(&"k"));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(c.get(&"k"), None);
    }

    #[tokio::test]
    async fn test_panicking_loader_clears_flight() {
        let c = cache(CacheConfig::default());
        let err = c
            .get_or_load("k", None, || async {
                if true {
                    panic!("loader exploded");
                }
                Ok::<u32, io::Error>(0)
            })
            .await
            .unwrap_err();
        let cause = err.cause_as::<LoaderPanicked>().unwrap();
        assert!(cause.0.contains("loader exploded"));

        let v = c
            .get_or_load("k", None, || async { Ok::<_, io::Error>(5) })
            .await
            .unwrap();
        assert_eq!(v, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_keeps_load_running() {
        let c = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let err = c
            .get_or_load_within("k", None, Duration::from_millis(10), counted(&calls, 4, Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "cache_deadline_exceeded");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(c.get(&"k"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_accessed() {
        let c = cache(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        c.insert("a", 1, None);
        c.insert("b", 2, None);
        assert_eq!(c.get(&"a"), Some(1));
        c.insert("c", 3, None);

        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"b"), None);
        assert_eq!(c.get(&"a"), Some(1));
        assert_eq!(c.get(&"c"), Some(3));
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_purges_expired_before_lru() {
        let c = cache(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        c.insert("old", 1, Some(Duration::from_millis(10)));
        c.insert("b", 2, None);
        tokio::time::advance(Duration::from_millis(20)).await;
        c.insert("c", 3, None);

        assert_eq!(c.get(&"b"), Some(2));
        assert_eq!(c.get(&"c"), Some(3));
        let stats = c.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_ignores_loads_in_flight() {
        let c = cache(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = {
            let c = c.clone();
            let loader = counted(&calls, 9, Duration::from_secs(1));
            tokio::spawn(async move { c.get_or_load("slow", None, loader).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        c.insert("a", 1, None);
        c.insert("b", 2, None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"a"), Some(1));
        assert_eq!(c.get(&"b"), Some(2));
        assert_eq!(c.stats().evictions, 0);

        // The finished load is the third stored value; the oldest access goes.
        assert_eq!(slow.await.unwrap().unwrap(), 9);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"a"), None);
        assert_eq!(c.get(&"slow"), Some(9));
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_evicts_expired_before_fresh() {
        let c = cache(CacheConfig {
            max_entries: 2,
            stale_window: Duration::from_secs(10),
            ..CacheConfig::default()
        });
        c.insert("b", 2, Some(Duration::from_secs(60)));
        c.insert("a", 1, Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        c.insert("c", 3, None);

        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"b"), Some(2));
        assert_eq!(c.get(&"c"), Some(3));
        let stats = c.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.expirations, 0);

        // Nothing of "a" is left to serve stale.
        let calls = Arc::new(AtomicUsize::new(0));
        let got = c
            .get_stale_while_revalidate("a", None, None, counted(&calls, 5, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got.freshness, Freshness::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_entries_past_stale_window() {
        let c = cache(CacheConfig {
            stale_window: Duration::from_secs(1),
            ..CacheConfig::default()
        });
        c.insert("a", 1, Some(Duration::from_secs(1)));
        c.insert("b", 2, Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(c.sweep(), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(c.sweep(), 1);
        assert_eq!(c.len(), 1);
    }
}
