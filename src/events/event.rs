//! # Runtime events emitted by the serving core.
//!
//! The [`EventKind`] enum classifies event types across four groups:
//! - **Process events**: worker process lifecycle under the supervisor
//! - **Pool events**: backpressure and deadline conditions of the worker pool
//! - **Shutdown events**: supervisor drain outcome
//! - **Subscriber events**: delivery problems of the fan-out itself
//!
//! The [`Event`] struct carries optional metadata (worker id, slot, task id,
//! reason, delay, restart count) set depending on the kind.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use servevisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RespawnScheduled)
//!     .with_worker("worker-1#3")
//!     .with_slot(1)
//!     .with_delay(Duration::from_millis(400))
//!     .with_restarts(3);
//!
//! assert_eq!(ev.kind, EventKind::RespawnScheduled);
//! assert_eq!(ev.worker.as_deref(), Some("worker-1#3"));
//! assert_eq!(ev.delay_ms, Some(400));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Process events ===
    /// A worker process was launched into a slot.
    ///
    /// Sets: `worker`, `slot`, `restarts`.
    WorkerSpawned,

    /// A worker process reported ready.
    ///
    /// Sets: `worker`, `slot`.
    WorkerReady,

    /// A worker process terminated (returned, failed, panicked or was killed).
    ///
    /// Sets: `worker`, `slot`, `reason`, `restarts`.
    WorkerDied,

    /// A respawn was scheduled after backoff.
    ///
    /// Sets: `worker` (the dead one), `slot`, `delay_ms`, `restarts`.
    RespawnScheduled,

    /// A slot exceeded its restart ceiling (or failed fatally) and was quarantined.
    ///
    /// Sets: `slot`, `reason`, `restarts`.
    PoolDegraded,

    /// Work left in a dead process's inbox could not be re-homed.
    ///
    /// Sets: `worker`, `slot`, `reason`.
    WorkOrphaned,

    // === Pool events ===
    /// `submit` was rejected because the queue is at its maximum depth.
    ///
    /// Sets: `reason` (depth).
    QueueFull,

    /// A task missed its deadline (while queued or running).
    ///
    /// Sets: `task`.
    TaskDeadlineExceeded,

    // === Shutdown events ===
    /// Shutdown requested (explicit call or OS signal).
    ShutdownRequested,

    /// All processes drained within the drain timeout.
    AllStoppedWithin,

    /// Drain timeout exceeded; stragglers were terminated.
    ///
    /// Sets: `reason` (stuck processes).
    GraceExceeded,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `worker` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `worker` (subscriber name), `reason`.
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Worker process identity (`worker-<slot>#<generation>`) or subscriber name.
    pub worker: Option<Arc<str>>,
    /// Supervisor slot index.
    pub slot: Option<usize>,
    /// Worker pool task id.
    pub task: Option<u64>,
    /// Human-readable reason (exit reason, overflow details, ...).
    pub reason: Option<Arc<str>>,
    /// Backoff delay before respawn in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Restart count of the slot at the time of the event.
    pub restarts: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker: None,
            slot: None,
            task: None,
            reason: None,
            delay_ms: None,
            restarts: None,
        }
    }

    /// Attaches a worker (or subscriber) name.
    #[inline]
    pub fn with_worker(mut self, worker: impl Into<Arc<str>>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Attaches a slot index.
    #[inline]
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attaches a task id.
    #[inline]
    pub fn with_task(mut self, task: u64) -> Self {
        self.task = Some(task);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a respawn delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches a restart count.
    #[inline]
    pub fn with_restarts(mut self, n: u32) -> Self {
        self.restarts = Some(n);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_worker(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_worker(subscriber)
            .with_reason(info)
    }

    /// True for events describing a process slot (spawn, death, respawn, quarantine).
    #[inline]
    pub fn is_process_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkerSpawned
                | EventKind::WorkerReady
                | EventKind::WorkerDied
                | EventKind::RespawnScheduled
                | EventKind::PoolDegraded
                | EventKind::WorkOrphaned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Event::new(EventKind::WorkerSpawned);
        let b = Event::new(EventKind::WorkerReady);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_delay_saturates() {
        let ev = Event::new(EventKind::RespawnScheduled).with_delay(Duration::from_secs(u64::MAX));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
