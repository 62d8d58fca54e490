//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: supervisor control loop, worker pool, `SubscriberSet` workers
//!   (overflow/panic).
//! - **Consumers**: `SubscriberSet::spawn_listener()` (fans out to user subscribers),
//!   or any caller of [`Bus::subscribe`].

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
