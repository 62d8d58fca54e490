//! Token-bucket arithmetic. Pure functions of the bucket, its parameters and `now`.

use std::time::Duration;

use tokio::time::Instant;

use crate::limiter::config::BucketConfig;

/// Longest wait ever reported (for zero refill rates or requests above capacity).
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

/// Outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    /// Whether the request was admitted.
    pub admitted: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Denied: when enough tokens will be available. Admitted: when the bucket is full again.
    pub reset_at: Instant,
}

impl Decision {
    /// Time until `reset_at` for a denied request; `None` if admitted.
    pub fn retry_after(&self) -> Option<Duration> {
        (!self.admitted).then(|| self.reset_at.saturating_duration_since(Instant::now()))
    }
}

pub(crate) struct Bucket {
    tokens: f64,
    last_refill: Instant,
    pub(crate) last_seen: Instant,
}

impl Bucket {
    pub(crate) fn new(cfg: &BucketConfig, now: Instant) -> Self {
        Self {
            tokens: if cfg.start_full {
                cfg.capacity_clamped()
            } else {
                0.0
            },
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, cfg: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * cfg.rate()).min(cfg.capacity_clamped());
        self.last_refill = now;
    }

    /// Refills, then tries to consume `n` tokens.
    pub(crate) fn take(&mut self, cfg: &BucketConfig, n: u32, now: Instant) -> Decision {
        self.refill(cfg, now);
        self.last_seen = now;

        let need = f64::from(n);
        let admitted = self.tokens >= need;
        let deficit = if admitted {
            self.tokens -= need;
            cfg.capacity_clamped() - self.tokens
        } else if need > cfg.capacity_clamped() {
            f64::INFINITY
        } else {
            need - self.tokens
        };

        Decision {
            admitted,
            remaining: self.tokens.floor() as u32,
            reset_at: now + wait_for(deficit, cfg.rate()),
        }
    }

    /// True if the bucket would be full at `now`, so dropping it loses nothing.
    pub(crate) fn is_full_at(&self, cfg: &BucketConfig, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * cfg.rate() >= cfg.capacity_clamped()
    }
}

fn wait_for(deficit: f64, rate: f64) -> Duration {
    if deficit <= 0.0 {
        return Duration::ZERO;
    }
    if rate <= 0.0 || !deficit.is_finite() {
        return MAX_WAIT;
    }
    Duration::try_from_secs_f64(deficit / rate)
        .map(|d| d.min(MAX_WAIT))
        .unwrap_or(MAX_WAIT)
}
