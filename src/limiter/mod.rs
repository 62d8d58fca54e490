//! Admission control: per-key token buckets.
//!
//! ## Contents
//! - [`RateLimiter`] allow / allow_class / allow_n / check / reclaim_idle
//! - [`Decision`] admitted, remaining tokens, reset instant
//! - [`RateLimiterConfig`], [`BucketConfig`] settings per key class

mod bucket;
mod config;
mod core;

pub use bucket::Decision;
pub use config::{BucketConfig, RateLimiterConfig};
pub use core::RateLimiter;
