//! # Request flow: admission, cache, pool, store-back.
//!
//! ```text
//! serve(caller, key, payload)
//!   ├─► RateLimiter::allow_class(class, caller) ── denied ──► ServeError::RateLimited
//!   ├─► Cache::get_or_load(key, ttl, ..)          ── hit ─────► value
//!   │        └─ miss (one caller per key):
//!   │             WorkerPool::submit(payload, deadline) ─► TaskHandle::wait
//!   │             ├─ Ok  → stored with expiry now + ttl, returned to every waiter
//!   │             └─ Err → not stored; ServeError::Pool(QueueFull | DeadlineExceeded | ...)
//!   └─► value
//! ```
//!
//! The payload of a request that joins an existing load is dropped unused.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use crate::cache::{Cache, Cached};
use crate::config::Config;
use crate::error::{PoolError, ServeError};
use crate::events::Bus;
use crate::limiter::RateLimiter;
use crate::pool::{Executor, WorkerPool};

/// Wires a [`RateLimiter`], a [`Cache`] and a [`WorkerPool`] in serving order.
pub struct Pipeline<K, E: Executor> {
    limiter: RateLimiter,
    cache: Cache<K, E::Output>,
    pool: WorkerPool<E>,
    class: Option<String>,
    ttl: Option<Duration>,
    deadline: Option<Duration>,
}

impl<K, E: Executor> Clone for Pipeline<K, E> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            class: self.class.clone(),
            ttl: self.ttl,
            deadline: self.deadline,
        }
    }
}

impl<K, E> Pipeline<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Executor,
    E::Output: Clone + Sync,
{
    /// Assembles a pipeline from existing components.
    pub fn new(limiter: RateLimiter, cache: Cache<K, E::Output>, pool: WorkerPool<E>) -> Self {
        Self {
            limiter,
            cache,
            pool,
            class: None,
            ttl: None,
            deadline: None,
        }
    }

    /// Builds every component from `cfg`. Must be called within a tokio runtime.
    pub fn from_config(cfg: &Config, executor: E, bus: Bus) -> Self {
        Self::new(
            RateLimiter::new(cfg.limiter.clone()),
            Cache::new(cfg.cache.clone()),
            WorkerPool::new(cfg.pool.clone(), executor, bus),
        )
    }

    /// Rate-limit callers in this key class instead of the default bucket.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// TTL of stored results (`None` = cache default).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Deadline of each pool task (`None` = pool default).
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The admission stage.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The cache stage.
    pub fn cache(&self) -> &Cache<K, E::Output> {
        &self.cache
    }

    /// The execution stage.
    pub fn pool(&self) -> &WorkerPool<E> {
        &self.pool
    }

    /// Serves one request.
    ///
    /// # Errors
    /// - [`ServeError::RateLimited`] when `caller` is out of tokens.
    /// - [`ServeError::Pool`] when the pool rejected or failed the work.
    /// - [`ServeError::Cache`] when the load was cancelled or failed otherwise.
    pub async fn serve(
        &self,
        caller: &str,
        key: K,
        payload: E::Payload,
    ) -> Result<E::Output, ServeError> {
        self.admit(caller)?;
        let load = self.loader(payload);
        Ok(self.cache.get_or_load(key, self.ttl, load).await?)
    }

    /// [`serve`](Self::serve) with stale-while-revalidate reads: an expired value
    /// inside the cache's stale window is returned at once while one refresh runs
    /// on the pool.
    pub async fn serve_stale(
        &self,
        caller: &str,
        key: K,
        payload: E::Payload,
    ) -> Result<Cached<E::Output>, ServeError> {
        self.admit(caller)?;
        let load = self.loader(payload);
        Ok(self
            .cache
            .get_stale_while_revalidate(key, self.ttl, None, load)
            .await?)
    }

    fn admit(&self, caller: &str) -> Result<(), ServeError> {
        let decision = match &self.class {
            Some(class) => self.limiter.check_class(class, caller),
            None => self.limiter.check(caller),
        };
        if let Err(denied) = &decision {
            tracing::debug!(caller, retry_after = ?denied.retry_after, "request rate limited");
        }
        decision.map(drop).map_err(ServeError::from)
    }

    fn loader(
        &self,
        payload: E::Payload,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<E::Output, PoolError>>
    + use<K, E> {
        use futures::FutureExt;

        let pool = self.pool.clone();
        let deadline = self.deadline;
        move || {
            let task = pool.submit(payload, deadline);
            async move { task?.wait().await }.boxed()
        }
    }
}
