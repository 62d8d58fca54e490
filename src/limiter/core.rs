//! # Token-bucket admission control per caller key.
//!
//! ```text
//! allow_class(class, key)
//!   └─► class map (fixed at construction) ─► per-key bucket (sharded map entry)
//!         └─► refill by elapsed × rate (capped) ─► take one token ─► Decision
//! ```
//!
//! Checks on distinct keys only contend when they hash to the same shard, and
//! only for the few arithmetic operations of one check. `allow` never fails:
//! exhaustion is `admitted: false`; [`RateLimiter::check`] turns it into a
//! [`RateLimited`] error carrying the retry hint.
//!
//! ## Example
//! ```rust
//! use servevisor::{BucketConfig, RateLimiter, RateLimiterConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimiterConfig {
//!     default: BucketConfig::new(2, 1.0),
//!     ..RateLimiterConfig::default()
//! });
//!
//! assert!(limiter.allow("10.0.0.1").admitted);
//! assert!(limiter.allow("10.0.0.1").admitted);
//! let denied = limiter.check("10.0.0.1").unwrap_err();
//! assert!(denied.retry_after.as_millis() > 0);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RateLimited;
use crate::limiter::bucket::{Bucket, Decision};
use crate::limiter::config::{BucketConfig, RateLimiterConfig};

struct Class {
    cfg: BucketConfig,
    buckets: DashMap<String, Bucket>,
}

impl Class {
    fn new(cfg: BucketConfig) -> Self {
        Self {
            cfg,
            buckets: DashMap::new(),
        }
    }

    fn take(&self, key: &str, n: u32) -> Decision {
        let now = Instant::now();
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.take(&self.cfg, n, now);
        }
        self.buckets
            .entry(key.to_owned())
            .or_insert_with(|| Bucket::new(&self.cfg, now))
            .take(&self.cfg, n, now)
    }

    fn reclaim(&self, idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            now.saturating_duration_since(b.last_seen) < idle
                || (self.cfg.start_full && !b.is_full_at(&self.cfg, now))
        });
        before.saturating_sub(self.buckets.len())
    }
}

struct Inner {
    cfg: RateLimiterConfig,
    default: Class,
    classes: HashMap<String, Class>,
}

/// Per-key token-bucket rate limiter.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Creates a limiter with one bucket map per configured class.
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let classes = cfg
            .classes
            .iter()
            .map(|(name, bucket)| (name.clone(), Class::new(bucket.clone())))
            .collect();
        Self {
            inner: Arc::new(Inner {
                default: Class::new(cfg.default.clone()),
                classes,
                cfg,
            }),
        }
    }

    /// Limiter settings.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.cfg
    }

    /// Admission check for `key` against the default bucket. Never fails.
    pub fn allow(&self, key: &str) -> Decision {
        self.inner.default.take(key, 1)
    }

    /// Admission check for `key` in `class`. Unknown classes use the default bucket.
    pub fn allow_class(&self, class: &str, key: &str) -> Decision {
        self.class(class).take(key, 1)
    }

    /// Consumes `n` tokens at once (all or nothing).
    pub fn allow_n(&self, class: Option<&str>, key: &str, n: u32) -> Decision {
        match class {
            Some(class) => self.class(class).take(key, n),
            None => self.inner.default.take(key, n),
        }
    }

    /// [`allow`](Self::allow) as a `Result`.
    ///
    /// # Errors
    /// [`RateLimited`] with `reset_at` / `retry_after` when the key is exhausted.
    pub fn check(&self, key: &str) -> Result<Decision, RateLimited> {
        into_result(self.allow(key), key)
    }

    /// [`allow_class`](Self::allow_class) as a `Result`.
    pub fn check_class(&self, class: &str, key: &str) -> Result<Decision, RateLimited> {
        into_result(self.allow_class(class, key), key)
    }

    /// Drops buckets idle for longer than `idle_reclaim`. Returns how many.
    ///
    /// With `start_full`, a bucket is only dropped once it has refilled, so
    /// reclaiming never grants a key more tokens than waiting would.
    pub fn reclaim_idle(&self) -> usize {
        let Some(idle) = self.inner.cfg.idle_reclaim() else {
            return 0;
        };
        let now = Instant::now();
        let reclaimed = self.inner.default.reclaim(idle, now)
            + self
                .inner
                .classes
                .values()
                .map(|c| c.reclaim(idle, now))
                .sum::<usize>();
        if reclaimed > 0 {
            tracing::trace!(reclaimed, "reclaimed idle rate-limit buckets");
        }
        reclaimed
    }

    /// Runs [`reclaim_idle`](Self::reclaim_idle) every `idle_reclaim` until `token`
    /// is cancelled. Returns `None` when reclaiming is disabled.
    pub fn spawn_reclaimer(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.inner.cfg.idle_reclaim()?;
        let limiter = self.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        limiter.reclaim_idle();
                    }
                }
            }
        }))
    }

    /// Number of live buckets across all classes.
    pub fn len(&self) -> usize {
        self.inner.default.buckets.len()
            + self
                .inner
                .classes
                .values()
                .map(|c| c.buckets.len())
                .sum::<usize>()
    }

    /// True if no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn class(&self, class: &str) -> &Class {
        self.inner.classes.get(class).unwrap_or(&self.inner.default)
    }
}

fn into_result(decision: Decision, key: &str) -> Result<Decision, RateLimited> {
    if decision.admitted {
        return Ok(decision);
    }
    Err(RateLimited {
        key: key.to_owned(),
        reset_at: decision.reset_at,
        retry_after: decision
            .reset_at
            .saturating_duration_since(Instant::now()),
    })
}
