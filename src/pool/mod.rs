//! Bounded worker pool for CPU-heavy work.
//!
//! ## Contents
//! - [`WorkerPool`] submission, cancellation, stats and shutdown
//! - [`Executor`], [`ExecFn`], [`BlockingFn`] the code a task runs
//! - [`TaskHandle`], [`TaskId`], [`TaskState`], [`Priority`], [`PoolStats`] task records
//! - [`PoolConfig`] settings

mod config;
mod core;
mod executor;
mod queue;
mod task;

pub use config::PoolConfig;
pub use core::WorkerPool;
pub use executor::{BlockingFn, ExecFn, Executor};
pub use task::{PoolStats, Priority, TaskHandle, TaskId, TaskState};
