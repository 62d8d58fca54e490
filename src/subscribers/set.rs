//! # Non-blocking event fan-out to multiple subscribers.
//!
//! ```text
//! Bus ──► spawn_listener ──► emit(event)
//!                               │
//!                               ├──► [queue 1] ──► worker 1 ──► subscriber1.on_event()
//!                               │    (bounded)         └──────► panic → SubscriberPanicked
//!                               └──► [queue N] ──► worker N ──► subscriberN.on_event()
//! ```
//!
//! ## Rules
//! - **Per-subscriber FIFO**, no cross-subscriber ordering
//! - **Overflow**: event dropped for that subscriber only, `SubscriberOverflow` published
//! - **Non-blocking**: `emit()` uses `try_send`
//! - **Isolation**: a panicking subscriber is reported and keeps receiving events

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::panic_message;
use crate::events::{Bus, Event, EventKind};
use crate::subscribers::Subscribe;

struct SubscriberChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
}

/// Fan-out coordinator for event subscribers.
pub struct SubscriberSet {
    channels: Vec<SubscriberChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Creates a new set and spawns one worker task per subscriber.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(sub.queue_capacity().max(1));
            let worker_bus = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = sub.on_event(ev.as_ref());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        worker_bus.publish(Event::subscriber_panicked(
                            sub.name(),
                            panic_message(&*panic),
                        ));
                    }
                }
            });
            channels.push(SubscriberChannel { name, sender: tx });
            workers.push(handle);
        }
        Self {
            channels,
            workers,
            bus,
        }
    }

    /// Number of attached subscribers.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if no subscriber is attached.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Emits an event to all subscribers without waiting for them.
    ///
    /// Overflow events are not re-published when they overflow themselves.
    pub fn emit(&self, event: &Event) {
        let event = Arc::new(event.clone());
        let is_overflow = matches!(event.kind, EventKind::SubscriberOverflow);

        for channel in &self.channels {
            let reason = match channel.sender.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => "full",
                Err(mpsc::error::TrySendError::Closed(_)) => "closed",
            };
            if !is_overflow {
                self.bus
                    .publish(Event::subscriber_overflow(channel.name, reason));
            }
        }
    }

    /// Forwards every event published on `bus` to this set until `token` is cancelled.
    pub fn spawn_listener(self: &Arc<Self>, bus: &Bus, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let set = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => set.emit(&ev),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event listener lagged behind the bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Closes every queue and waits for subscriber workers to finish.
    pub async fn shutdown(self) {
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::SubscribeFn;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = Bus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let subs: Vec<Arc<dyn Subscribe>> = vec![
            SubscribeFn::arc("a", move |ev| a.lock().unwrap().push(("a", ev.kind))),
            SubscribeFn::arc("b", move |ev| b.lock().unwrap().push(("b", ev.kind))),
        ];
        let set = SubscriberSet::new(subs, bus);
        set.emit(&Event::new(EventKind::WorkerSpawned));
        set.shutdown().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|(name, _)| *name);
        assert_eq!(
            seen,
            vec![("a", EventKind::WorkerSpawned), ("b", EventKind::WorkerSpawned)]
        );
    }

    struct Panicky;

    #[async_trait]
    impl Subscribe for Panicky {
        async fn on_event(&self, _ev: &Event) {
            panic!("subscriber exploded");
        }
        fn name(&self) -> &'static str {
            "panicky"
        }
    }

    #[tokio::test]
    async fn test_panic_is_reported_on_bus() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let set = SubscriberSet::new(vec![Arc::new(Panicky)], bus.clone());
        set.emit(&Event::new(EventKind::WorkerDied));

        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("panic reported in time")
            .expect("bus open");
        assert_eq!(ev.kind, EventKind::SubscriberPanicked);
        assert_eq!(ev.worker.as_deref(), Some("panicky"));
        assert_eq!(ev.reason.as_deref(), Some("subscriber exploded"));
    }

    #[tokio::test]
    async fn test_listener_forwards_bus_events() {
        let bus = Bus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub: Arc<dyn Subscribe> = SubscribeFn::arc("fwd", move |ev| {
            let _ = tx.send(ev.kind);
        });
        let set = Arc::new(SubscriberSet::new(vec![sub], bus.clone()));
        let token = CancellationToken::new();
        let listener = set.spawn_listener(&bus, token.clone());

        bus.publish(Event::new(EventKind::PoolDegraded));
        let kind = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("forwarded in time");
        assert_eq!(kind, Some(EventKind::PoolDegraded));

        token.cancel();
        listener.await.expect("listener exits");
    }
}
