//! # LogWriter: renders events through `tracing`
//!
//! A minimal subscriber that turns every [`Event`] into one structured `tracing`
//! record. Process deaths and overload conditions are logged at `warn`,
//! quarantine and forced shutdown at `error`, the rest at `info`.
//!
//! ## Example output (with `tracing_subscriber::fmt`)
//! ```text
//! INFO  worker spawned worker="worker-0#1" slot=0
//! WARN  worker died worker="worker-0#1" slot=0 reason="panicked: boom" restarts=1
//! INFO  respawn scheduled worker="worker-0#1" slot=0 delay_ms=100
//! ERROR pool degraded slot=0 restarts=6 reason="restart ceiling exceeded"
//! ```

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let worker = e.worker.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::WorkerSpawned => {
                info!(worker, slot = e.slot, restarts = e.restarts, "worker spawned");
            }
            EventKind::WorkerReady => {
                info!(worker, slot = e.slot, "worker ready");
            }
            EventKind::WorkerDied => {
                warn!(worker, slot = e.slot, reason, restarts = e.restarts, "worker died");
            }
            EventKind::RespawnScheduled => {
                info!(worker, slot = e.slot, delay_ms = e.delay_ms, "respawn scheduled");
            }
            EventKind::PoolDegraded => {
                error!(slot = e.slot, restarts = e.restarts, reason, "pool degraded");
            }
            EventKind::WorkOrphaned => {
                warn!(worker, slot = e.slot, reason, "work orphaned");
            }
            EventKind::QueueFull => {
                warn!(reason, "worker pool queue full");
            }
            EventKind::TaskDeadlineExceeded => {
                warn!(task = e.task, "task deadline exceeded");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!("all workers stopped within drain timeout");
            }
            EventKind::GraceExceeded => {
                error!(reason, "drain timeout exceeded");
            }
            EventKind::SubscriberOverflow => {
                warn!(subscriber = worker, reason, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = worker, reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
