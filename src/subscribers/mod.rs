//! # Event subscribers.
//!
//! [`Subscribe`] is the observability hook of the core; [`SubscriberSet`] fans
//! bus events out to subscribers through isolated bounded queues.
//!
//! ```text
//! Bus ──► SubscriberSet ──┬──► LogWriter (feature `logging`)
//!                         ├──► SubscribeFn (closure callbacks)
//!                         └──► custom metrics / alerting
//! ```

mod log;
mod set;
mod subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::{Subscribe, SubscribeFn};
