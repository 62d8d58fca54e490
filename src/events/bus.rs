//! # Event bus shared by every component of the core.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`]. The supervisor
//! control loop, the worker pool and the subscriber set all publish into one bus;
//! a [`SubscriberSet`](crate::SubscriberSet) listener fans events out to observers.
//!
//! ```text
//!   Supervisor ──┐
//!   WorkerPool ──┼──► Bus ──► SubscriberSet::spawn_listener ──► Subscribe::on_event
//!   Subscribers ─┘   (broadcast chan)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks.
//! - **Bounded capacity**: one ring buffer stores recent events for all receivers.
//! - **Lag handling**: slow receivers get `RecvError::Lagged(n)` and skip `n` oldest items.
//! - **No persistence**: events are lost if there are no active receivers at send time.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all active receivers; dropped if there are none.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a new receiver that observes events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    /// A bus with capacity 1024.
    fn default() -> Self {
        Self::new(1024)
    }
}
