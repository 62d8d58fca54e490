//! # Worker processes and their side of the supervisor protocol.
//!
//! A worker process is a long-lived unit of execution hosted on its own tokio
//! task. It shares nothing with the supervisor: work arrives through a bounded
//! inbox, and the process talks back only through [`ProcessContext`] messages.
//!
//! ```text
//! Supervisor::dispatch(work) ──try_send──► [inbox] ──► ctx.recv() ──► handle work
//!                                                        │
//! control loop ◄── Ready / Heartbeat ◄── ctx.ready() / ctx.heartbeat()
//! control loop ◄── Exited { reason, orphans } ◄── task wrapper (return / error / panic)
//! ```
//!
//! ## Lifecycle
//! `Starting → Ready → Busy ⇄ Ready → Draining → Dead`, and `Dead → Starting` on
//! respawn unless the slot is `Quarantined`.
//!
//! ## Example
//! ```rust
//! use servevisor::{ExecError, ProcessContext, ProcessFn, ProcessRef};
//!
//! let echo: ProcessRef<String> = ProcessFn::arc(|ctx: ProcessContext<String>| async move {
//!     ctx.ready();
//!     while let Some(line) = ctx.recv().await {
//!         if line == "poison" {
//!             return Err(ExecError::fail("poisoned input"));
//!         }
//!         ctx.heartbeat();
//!     }
//!     Ok(())
//! });
//! # let _ = echo;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::supervisor::control::Control;

/// Identity of one incarnation of a slot.
///
/// The generation grows on every respawn, so messages from a replaced process
/// can be told apart from its successor's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    /// Slot index in `0..pool_size`.
    pub slot: usize,
    /// Incarnation of the slot, starting at 1.
    pub generation: u64,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}#{}", self.slot, self.generation)
    }
}

/// Lifecycle state of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Launched, not yet ready.
    Starting,
    /// Ready and idle.
    Ready,
    /// Ready with work in flight.
    Busy,
    /// Shutdown requested; finishing buffered work.
    Draining,
    /// Exited; a respawn may be pending.
    Dead,
    /// Over its restart ceiling (or failed fatally). Never respawned until reset.
    Quarantined,
}

impl ProcessState {
    /// True for states that may receive dispatched work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, ProcessState::Ready | ProcessState::Busy)
    }
}

/// Why a process stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The run loop returned `Ok(())` (or `ExecError::Canceled`).
    Completed,
    /// The run loop returned a retryable error.
    Failed(String),
    /// The run loop returned [`ExecError::Fatal`]; the slot is quarantined.
    Fatal(String),
    /// The run loop panicked.
    Panicked(String),
    /// The supervisor terminated the process (heartbeat timeout, synthetic death).
    Killed(String),
}

impl ExitReason {
    pub(crate) fn from_result(res: Result<(), ExecError>) -> Self {
        match res {
            Ok(()) | Err(ExecError::Canceled) => ExitReason::Completed,
            Err(ExecError::Fatal { error }) => ExitReason::Fatal(error),
            Err(e) => ExitReason::Failed(e.to_string()),
        }
    }

    /// True if the slot must not be respawned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExitReason::Fatal(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Completed => f.write_str("completed"),
            ExitReason::Failed(e) => write!(f, "failed: {e}"),
            ExitReason::Fatal(e) => write!(f, "fatal: {e}"),
            ExitReason::Panicked(e) => write!(f, "panicked: {e}"),
            ExitReason::Killed(e) => write!(f, "killed: {e}"),
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    /// Current (or last) incarnation.
    pub id: WorkerId,
    /// Lifecycle state.
    pub state: ProcessState,
    /// Deaths of this slot since start (or since its last reset).
    pub restarts: u32,
    /// Last readiness or heartbeat message.
    pub last_heartbeat: Option<Instant>,
    /// When a pending respawn fires.
    pub backoff_until: Option<Instant>,
    /// Work dispatched to the process and not yet finished.
    pub in_flight: usize,
}

/// Body of a supervised worker process.
///
/// Returning (with or without error) or panicking ends the incarnation; the
/// supervisor then decides whether to respawn the slot.
#[async_trait]
pub trait Process<W>: Send + Sync + 'static {
    /// Runs until the inbox is drained or the process fails.
    async fn run(&self, ctx: ProcessContext<W>) -> Result<(), ExecError>;
}

/// Shared handle to a process body.
pub type ProcessRef<W> = Arc<dyn Process<W>>;

/// Closure-backed [`Process`]; each incarnation gets a fresh future.
pub struct ProcessFn<F> {
    f: F,
}

impl<F> ProcessFn<F> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wraps `f` and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<W, F, Fut> Process<W> for ProcessFn<F>
where
    W: Send + 'static,
    F: Fn(ProcessContext<W>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecError>> + Send + 'static,
{
    async fn run(&self, ctx: ProcessContext<W>) -> Result<(), ExecError> {
        (self.f)(ctx).await
    }
}

/// The process's end of the supervisor protocol.
pub struct ProcessContext<W> {
    id: WorkerId,
    inbox: Arc<Mutex<mpsc::Receiver<W>>>,
    control: mpsc::UnboundedSender<Control<W>>,
    token: CancellationToken,
    load: Arc<AtomicUsize>,
    holding: AtomicBool,
}

impl<W: Send + 'static> ProcessContext<W> {
    pub(crate) fn new(
        id: WorkerId,
        inbox: Arc<Mutex<mpsc::Receiver<W>>>,
        control: mpsc::UnboundedSender<Control<W>>,
        token: CancellationToken,
        load: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            inbox,
            control,
            token,
            load,
            holding: AtomicBool::new(false),
        }
    }

    /// Identity of this incarnation.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Announces readiness. Idempotent.
    pub fn ready(&self) {
        let _ = self.control.send(Control::Ready(self.id));
    }

    /// Liveness signal; required when the supervisor runs with a heartbeat timeout.
    pub fn heartbeat(&self) {
        let _ = self.control.send(Control::Heartbeat(self.id));
    }

    /// Cancelled when the supervisor wants this process to drain and stop.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once draining was requested.
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next unit of work.
    ///
    /// Calling `recv` marks the previously received unit as finished. Once
    /// draining starts the inbox is closed, buffered work is still handed out,
    /// and `None` follows when it is empty.
    pub async fn recv(&self) -> Option<W> {
        self.finish_current();

        let mut rx = self.inbox.lock().await;
        let item = if self.token.is_cancelled() {
            rx.close();
            rx.recv().await
        } else {
            tokio::select! {
                biased;
                item = rx.recv() => item,
                _ = self.token.cancelled() => {
                    rx.close();
                    rx.recv().await
                }
            }
        };
        if item.is_some() {
            self.holding.store(true, Ordering::Release);
        }
        item
    }

    fn finish_current(&self) {
        if self.holding.swap(false, Ordering::AcqRel) {
            let _ = self
                .load
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(1))
                });
        }
    }
}

impl<W> fmt::Debug for ProcessContext<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("id", &self.id)
            .field("draining", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
