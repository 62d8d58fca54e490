//! Single-flight TTL cache with stale-while-revalidate reads and LRU bounding.
//!
//! ## Contents
//! - [`Cache`] get_or_load / stale-while-revalidate / invalidate / sweep
//! - [`Cached`], [`Freshness`] how a value was obtained
//! - [`CacheStats`] counters
//! - [`CacheConfig`] settings
//! - [`LoaderPanicked`] cause of a `LoadFailed` raised by a panicking loader

mod config;
mod core;
mod entry;

pub use config::CacheConfig;
pub use core::{Cache, CacheStats, Cached, Freshness, LoaderPanicked};
