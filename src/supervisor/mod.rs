//! # Process supervision.
//!
//! A [`Supervisor`] keeps `pool_size` long-lived worker processes alive, restarts
//! the ones that die with exponential backoff, quarantines slots that crash-loop,
//! and routes incoming work to the least-loaded ready process.
//!
//! ## Contents
//! - [`Supervisor`] start / dispatch / on_exit / reset / shutdown
//! - [`Process`], [`ProcessFn`], [`ProcessContext`] the worker side of the protocol
//! - [`SupervisorConfig`] pool size, inbox capacity, backoff, ceiling, heartbeat
//! - [`ProcessInfo`], [`ProcessState`], [`WorkerId`], [`ExitReason`] observation types

mod config;
mod control;
mod core;
mod process;
mod shutdown;

pub use config::SupervisorConfig;
pub use core::Supervisor;
pub use process::{
    ExitReason, Process, ProcessContext, ProcessFn, ProcessInfo, ProcessRef, ProcessState,
    WorkerId,
};
