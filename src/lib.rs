//! # servevisor
//!
//! **Servevisor** is the resilient concurrent core of a request-serving host.
//!
//! It provides four interlocking primitives: a supervisor that keeps a pool of
//! worker processes alive, a bounded worker pool for CPU-heavy work, a
//! single-flight TTL cache, and a token-bucket rate limiter. Every component is
//! an explicitly constructed value passed by reference; there are no globals.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   inbound request
//!         │
//!         ▼
//! ┌────────────────┐  denied   ┌──────────────────────────────┐
//! │  RateLimiter   │──────────►│ RateLimited { reset_at }     │
//! │ (token bucket) │           └──────────────────────────────┘
//! └───────┬────────┘
//!         ▼ admitted
//! ┌────────────────┐   hit
//! │     Cache      │──────────► value
//! │ (single-flight)│
//! └───────┬────────┘
//!         ▼ miss (one loader per key)
//! ┌────────────────┐           ┌──────────────────────────────┐
//! │   WorkerPool   │──────────►│ QueueFull / DeadlineExceeded │
//! │ (bounded slots)│           └──────────────────────────────┘
//! └───────┬────────┘
//!         ▼ result stored back into the Cache
//!
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ Supervisor (orthogonal): hosts the flow above in N worker         │
//! │ processes, restarts them with backoff, quarantines crash loops,   │
//! │ re-homes queued work of dead processes                            │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                   Bus (broadcast channel)                         │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 ▼
//!                   SubscriberSet ──► Subscribe::on_event
//! ```
//!
//! ### Process lifecycle
//! ```text
//! Starting ──► Ready ──► Busy ⇄ Ready ──► Draining ──► Dead
//!    ▲                                                  │
//!    └──────────── respawn after backoff ◄──────────────┤
//!                                                       └─► Quarantined (ceiling hit / fatal)
//!                                                             └─ reset(slot) ─► Starting
//! ```
//!
//! ## Features
//! | Area              | Description                                                    | Key types / traits                            |
//! |-------------------|----------------------------------------------------------------|-----------------------------------------------|
//! | **Supervision**   | Fixed pool of worker processes, restart, quarantine, drain.    | [`Supervisor`], [`Process`], [`ProcessFn`]    |
//! | **Worker pool**   | Bounded slots, priorities, deadlines, cancellation.            | [`WorkerPool`], [`Executor`], [`TaskHandle`]  |
//! | **Cache**         | Single-flight loads, TTL, stale-while-revalidate, LRU ceiling. | [`Cache`], [`Cached`]                         |
//! | **Admission**     | Token bucket per caller key and key class.                     | [`RateLimiter`], [`Decision`]                 |
//! | **Request flow**  | Limiter → cache → pool → store-back.                           | [`Pipeline`]                                  |
//! | **Policies**      | Respawn backoff, jitter, restart ceiling.                      | [`BackoffPolicy`], [`RestartCeiling`]         |
//! | **Subscriber API**| Hook into lifecycle events (logging, metrics, alerting).       | [`Subscribe`], [`SubscriberSet`]              |
//! | **Errors**        | Typed conditions with retry hints.                             | [`ServeError`], [`PoolError`], [`CacheError`] |
//! | **Configuration** | Centralized settings.                                          | [`Config`]                                    |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] subscriber that renders events through `tracing`.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use servevisor::{Config, ExecError, ExecFn, Pipeline, ServeError};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), ServeError> {
//!     let cfg = Config::default();
//!     let render = ExecFn::new(|page: u32, _ctx: CancellationToken| async move {
//!         Ok::<_, ExecError>(format!("<h1>page {page}</h1>"))
//!     });
//!
//!     let pipeline = Pipeline::from_config(&cfg, render, cfg.bus())
//!         .with_ttl(Duration::from_secs(30))
//!         .with_deadline(Duration::from_secs(2));
//!
//!     let html = pipeline.serve("203.0.113.7", 1u32, 1).await?;
//!     assert_eq!(html, "<h1>page 1</h1>");
//!
//!     // Served from the cache; the pool is not involved.
//!     let again = pipeline.serve("203.0.113.7", 1u32, 1).await?;
//!     assert_eq!(again, html);
//!     Ok(())
//! }
//! ```
mod cache;
mod config;
mod error;
mod events;
mod limiter;
mod pipeline;
mod policies;
mod pool;
mod subscribers;
mod supervisor;

// ---- Public re-exports ----

pub use cache::{Cache, CacheConfig, CacheStats, Cached, Freshness, LoaderPanicked};
pub use config::Config;
pub use error::{
    CacheError, ExecError, PoolError, RateLimited, Rejected, ServeError, SupervisorError,
};
pub use events::{Bus, Event, EventKind};
pub use limiter::{BucketConfig, Decision, RateLimiter, RateLimiterConfig};
pub use pipeline::Pipeline;
pub use policies::{BackoffPolicy, JitterPolicy, RestartCeiling};
pub use pool::{
    BlockingFn, ExecFn, Executor, PoolConfig, PoolStats, Priority, TaskHandle, TaskId, TaskState,
    WorkerPool,
};
pub use subscribers::{Subscribe, SubscribeFn, SubscriberSet};
pub use supervisor::{
    ExitReason, Process, ProcessContext, ProcessFn, ProcessInfo, ProcessRef, ProcessState,
    Supervisor, SupervisorConfig, WorkerId,
};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
