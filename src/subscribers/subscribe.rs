//! # Subscriber trait and closure adapter
//!
//! `Subscribe` is the `onEvent` hook of the core: the surrounding logging/metrics
//! system implements it to observe process, pool and shutdown events. Each
//! subscriber is driven by a dedicated worker loop fed by a bounded queue owned by
//! the [`SubscriberSet`](crate::SubscriberSet).
//!
//! ## Contract
//! - Implementations may be slow (I/O, batching); they do **not** block publishers
//!   nor other subscribers.
//! - Each subscriber declares its queue capacity via [`Subscribe::queue_capacity`].
//!   On overflow, events for that subscriber are dropped and a
//!   `SubscriberOverflow` event is published.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::Event;

/// Contract for event subscribers.
///
/// Called from a subscriber-dedicated worker task.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use servevisor::{Event, EventKind, Subscribe};
///
/// struct DegradedAlarm;
///
/// #[async_trait]
/// impl Subscribe for DegradedAlarm {
///     async fn on_event(&self, ev: &Event) {
///         if ev.kind == EventKind::PoolDegraded {
///             // page the operator
///         }
///     }
///     fn name(&self) -> &'static str { "degraded-alarm" }
/// }
/// ```
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handle a single event.
    async fn on_event(&self, event: &Event);

    /// Human-readable name (for logs/metrics).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}

/// Closure-backed subscriber for quick `onEvent` callbacks.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use servevisor::{EventKind, Subscribe, SubscribeFn};
///
/// let deaths = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&deaths);
/// let sub: Arc<dyn Subscribe> = SubscribeFn::arc("deaths", move |ev| {
///     if ev.kind == EventKind::WorkerDied {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// assert_eq!(sub.name(), "deaths");
/// ```
pub struct SubscribeFn<F> {
    name: &'static str,
    f: F,
}

impl<F> SubscribeFn<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    /// Wraps `f` as a subscriber.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }

    /// Wraps `f` and returns it as a shared handle.
    pub fn arc(name: &'static str, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F> Subscribe for SubscribeFn<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    async fn on_event(&self, event: &Event) {
        (self.f)(event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
