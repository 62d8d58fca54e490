//! # Supervisor: keeps a fixed pool of worker processes alive and routes work to them.
//!
//! ## Architecture
//! ```text
//! start(pool_size, min_ready, startup_timeout)
//!   └─► ControlLoop::fill()       one process per slot (Starting)
//!   └─► tokio::spawn(ControlLoop::run)
//!   └─► wait until min_ready processes are Ready, or abort everything → StartupTimeout
//!
//! dispatch(work)                  never suspends
//!   ├─ shutting down              → Rejected { ShuttingDown }
//!   ├─ least-loaded Ready inbox   → Ok(WorkerId)
//!   ├─ every slot quarantined     → Rejected { PoolDegraded }
//!   └─ otherwise                  → Rejected { NoCapacity { retry_after } }
//!
//! on_exit(id, reason)             synthetic death; the process is terminated and the
//!                                 control loop applies backoff / ceiling as for a crash
//!
//! shutdown(drain_timeout)
//!   └─► ShutdownRequested → Drain (processes finish buffered work)
//!   └─► join all within drain_timeout → AllStoppedWithin
//!                          otherwise  → abort stragglers → GraceExceeded
//! ```
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use servevisor::{Bus, ProcessContext, ProcessFn, Supervisor, SupervisorConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let echo = ProcessFn::arc(|ctx: ProcessContext<u64>| async move {
//!         ctx.ready();
//!         while let Some(_n) = ctx.recv().await {}
//!         Ok(())
//!     });
//!     let sup = Supervisor::new(SupervisorConfig::default(), echo, Bus::default());
//!     sup.start(2, 2, Duration::from_secs(1)).await?;
//!
//!     let worker = sup.dispatch(42).map_err(|r| r.into_error())?;
//!     assert!(worker.slot < 2);
//!
//!     sup.shutdown(Duration::from_secs(1)).await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Rejected, SupervisorError};
use crate::events::{Bus, Event, EventKind};
use crate::supervisor::config::SupervisorConfig;
use crate::supervisor::control::{Control, ControlLoop, Table, read, retry_after, route};
use crate::supervisor::process::{ExitReason, ProcessInfo, ProcessRef, ProcessState, WorkerId};
use crate::supervisor::shutdown;

type Pending<W> = (mpsc::UnboundedReceiver<Control<W>>, watch::Sender<usize>);

struct Inner<W> {
    cfg: SupervisorConfig,
    process: ProcessRef<W>,
    bus: Bus,
    table: Table<W>,
    control: mpsc::UnboundedSender<Control<W>>,
    pending: Mutex<Option<Pending<W>>>,
    ready: watch::Receiver<usize>,
    root: CancellationToken,
    cursor: Arc<AtomicUsize>,
    closing: AtomicBool,
}

impl<W> Drop for Inner<W> {
    fn drop(&mut self) {
        self.root.cancel();
        let _ = self.control.send(Control::Stop);
    }
}

/// Supervisor of a fixed-size pool of worker processes hosting work `W`.
///
/// Cheap to clone; clones share the same pool.
pub struct Supervisor<W> {
    inner: Arc<Inner<W>>,
}

impl<W> Clone for Supervisor<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Send + 'static> Supervisor<W> {
    /// Creates a supervisor; no process runs until [`start`](Self::start).
    pub fn new(cfg: SupervisorConfig, process: ProcessRef<W>, bus: Bus) -> Self {
        let (control, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                cfg,
                process,
                bus,
                table: Arc::new(RwLock::new(Vec::new())),
                control,
                pending: Mutex::new(Some((rx, ready_tx))),
                ready,
                root: CancellationToken::new(),
                cursor: Arc::new(AtomicUsize::new(0)),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Configuration this supervisor was built with.
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.cfg
    }

    /// Event bus the supervisor publishes to.
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Launches `pool_size` processes and waits until `min_ready` of them are ready.
    ///
    /// `min_ready` is clamped to `pool_size`. If the processes are not ready in
    /// time they are all stopped and [`SupervisorError::StartupTimeout`] is returned.
    pub async fn start(
        &self,
        pool_size: usize,
        min_ready: usize,
        startup_timeout: Duration,
    ) -> Result<(), SupervisorError> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }
        let (rx, ready_tx) = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SupervisorError::AlreadyStarted)?;

        let required = min_ready.min(pool_size);
        let ctl = ControlLoop::new(
            self.inner.cfg.clone(),
            Arc::clone(&self.inner.process),
            self.inner.bus.clone(),
            Arc::clone(&self.inner.table),
            self.inner.control.clone(),
            self.inner.root.clone(),
            ready_tx,
            Arc::clone(&self.inner.cursor),
        );
        ctl.fill(pool_size);
        tokio::spawn(ctl.run(rx));
        tracing::debug!(pool_size, required, "supervisor started");

        if self.wait_for_ready(required, startup_timeout).await {
            return Ok(());
        }
        let ready = self.ready_count();
        tracing::warn!(ready, required, ?startup_timeout, "startup timeout; stopping processes");
        self.abort_all().await;
        Err(SupervisorError::StartupTimeout {
            ready,
            required,
            timeout: startup_timeout,
        })
    }

    /// [`start`](Self::start) with the pool size, minimum and timeout from the config.
    pub async fn launch(&self) -> Result<(), SupervisorError> {
        let cfg = &self.inner.cfg;
        self.start(cfg.pool_size, cfg.min_ready, cfg.startup_timeout)
            .await
    }

    /// Forwards `work` to the least-loaded ready process without suspending.
    ///
    /// Work is never dropped: on failure it is returned inside [`Rejected`].
    pub fn dispatch(&self, work: W) -> Result<WorkerId, Rejected<W>> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(Rejected::new(work, SupervisorError::ShuttingDown));
        }
        let table = read(&self.inner.table);
        let cursor = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        match route(&table, cursor, work) {
            Ok(id) => Ok(id),
            Err(work) => {
                let quarantined = table
                    .iter()
                    .filter(|r| r.state == ProcessState::Quarantined)
                    .count();
                let error = if quarantined > 0 && quarantined == table.len() {
                    SupervisorError::PoolDegraded { quarantined }
                } else {
                    SupervisorError::NoCapacity {
                        retry_after: retry_after(&table, &self.inner.cfg),
                    }
                };
                Err(Rejected::new(work, error))
            }
        }
    }

    /// Reports that process `id` terminated.
    ///
    /// The process monitor calls this for every real exit; it can also be called
    /// directly to inject a death. A still-running process is terminated. Reports
    /// for an older generation of the slot are ignored.
    pub fn on_exit(&self, id: WorkerId, reason: ExitReason) {
        let _ = self.inner.control.send(Control::Exited {
            id,
            reason,
            orphans: Vec::new(),
            inbox_held: false,
        });
    }

    /// Brings a quarantined slot back (`Quarantined → Starting`) with a clean history.
    pub async fn reset(&self, slot: usize) -> Result<WorkerId, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .control
            .send(Control::Reset { slot, reply })
            .map_err(|_| SupervisorError::ShuttingDown)?;
        rx.await.map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Per-slot view of the pool.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        read(&self.inner.table).iter().map(|r| r.info()).collect()
    }

    /// Processes currently able to take work.
    pub fn ready_count(&self) -> usize {
        *self.inner.ready.borrow()
    }

    /// Waits until at least `n` processes are ready; `false` if `within` elapses first.
    pub async fn wait_for_ready(&self, n: usize, within: Duration) -> bool {
        let mut rx = self.inner.ready.clone();
        let reached = tokio::time::timeout(within, rx.wait_for(|ready| *ready >= n)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Stops accepting work, drains every process and waits up to `drain_timeout`.
    ///
    /// Processes still running afterwards are aborted and listed in
    /// [`SupervisorError::GraceExceeded`]. Calling it again is a no-op.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<(), SupervisorError> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner
            .bus
            .publish(Event::new(EventKind::ShutdownRequested));

        let never_started = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_started {
            self.inner.root.cancel();
            self.inner.bus.publish(Event::new(EventKind::AllStoppedWithin));
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        if self.inner.control.send(Control::Drain { reply }).is_err() {
            return Ok(());
        }
        let Ok(handles) = rx.await else {
            return Ok(());
        };

        let deadline = Instant::now() + drain_timeout;
        let mut stuck = Vec::new();
        for (id, mut join) in handles {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                join.abort();
                stuck.push(id.to_string());
            }
        }
        let _ = self.inner.control.send(Control::Stop);

        if stuck.is_empty() {
            self.inner.bus.publish(Event::new(EventKind::AllStoppedWithin));
            Ok(())
        } else {
            tracing::warn!(?drain_timeout, stuck = ?stuck, "drain timeout exceeded; processes aborted");
            self.inner
                .bus
                .publish(Event::new(EventKind::GraceExceeded).with_reason(stuck.join(", ")));
            Err(SupervisorError::GraceExceeded {
                grace: drain_timeout,
                stuck,
            })
        }
    }

    /// Stops every process without a drain period or shutdown events.
    async fn abort_all(&self) {
        self.inner.closing.store(true, Ordering::Release);
        let (reply, rx) = oneshot::channel();
        if self.inner.control.send(Control::Drain { reply }).is_ok() {
            if let Ok(handles) = rx.await {
                for (_, join) in handles {
                    join.abort();
                }
            }
        }
        let _ = self.inner.control.send(Control::Stop);
    }

    /// Waits for SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere), then shuts down.
    pub async fn run_until_signal(&self, drain_timeout: Duration) -> Result<(), SupervisorError> {
        if let Err(e) = shutdown::wait_for_shutdown_signal().await {
            tracing::warn!(error = %e, "signal registration failed; shutting down");
        }
        self.shutdown(drain_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::policies::{BackoffPolicy, JitterPolicy, RestartCeiling};
    use crate::supervisor::process::{ProcessContext, ProcessFn};

    fn cfg() -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffPolicy::constant(Duration::from_millis(100)),
            ceiling: RestartCeiling {
                max_restarts: 3,
                window: Duration::from_secs(60),
            },
            inbox_capacity: 2,
            ..SupervisorConfig::default()
        }
    }

    fn sink() -> ProcessRef<u32> {
        ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            while ctx.recv().await.is_some() {}
            Ok(())
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_min_ready() {
        let sup = Supervisor::new(cfg(), sink(), Bus::new(64));
        sup.start(3, 5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sup.ready_count(), 3);
        assert_eq!(sup.snapshot().len(), 3);
        assert_eq!(
            sup.start(3, 1, Duration::from_secs(1)).await,
            Err(SupervisorError::AlreadyStarted)
        );
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_stops_everything() {
        let never_ready = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.token().cancelled().await;
            Ok(())
        });
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg(), never_ready, bus);
        let err = sup.start(2, 1, Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(
            err,
            SupervisorError::StartupTimeout {
                ready: 0,
                required: 1,
                timeout: Duration::from_millis(200),
            }
        );
        assert!(matches!(
            sup.dispatch(1).unwrap_err().error,
            SupervisorError::ShuttingDown
        ));

        // A pool that never came up is stopped, not drained.
        settle().await;
        assert!(sup.snapshot().iter().all(|p| p.state == ProcessState::Dead));
        while let Ok(ev) = rx.try_recv() {
            assert!(
                !matches!(
                    ev.kind,
                    EventKind::ShutdownRequested
                        | EventKind::GraceExceeded
                        | EventKind::AllStoppedWithin
                ),
                "unexpected {:?}",
                ev.kind
            );
        }
        assert_eq!(sup.shutdown(Duration::ZERO).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_spreads_by_load() {
        let parked = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            ctx.token().cancelled().await;
            while ctx.recv().await.is_some() {}
            Ok(())
        });
        let sup = Supervisor::new(cfg(), parked, Bus::new(64));
        sup.start(2, 2, Duration::from_secs(1)).await.unwrap();

        let mut slots: Vec<usize> = (0..4).map(|n| sup.dispatch(n).unwrap().slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 0, 1, 1]);

        let rejected = sup.dispatch(99).unwrap_err();
        assert_eq!(rejected.work, 99);
        assert!(matches!(rejected.error, SupervisorError::NoCapacity { .. }));
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_death_respawns_next_generation() {
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg(), sink(), bus);
        sup.start(1, 1, Duration::from_secs(1)).await.unwrap();

        let first = sup.snapshot()[0].id;
        sup.on_exit(first, ExitReason::Killed("test".into()));
        settle().await;
        assert_eq!(sup.snapshot()[0].state, ProcessState::Dead);
        assert!(matches!(
            sup.dispatch(7).unwrap_err().error,
            SupervisorError::NoCapacity { .. }
        ));

        assert!(sup.wait_for_ready(1, Duration::from_secs(1)).await);
        let info = &sup.snapshot()[0];
        assert_eq!(info.id.generation, first.generation + 1);
        assert_eq!(info.restarts, 1);

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev.kind);
        }
        assert!(kinds.contains(&EventKind::WorkerDied));
        assert!(kinds.contains(&EventKind::RespawnScheduled));

        // Report about the replaced generation is stale.
        sup.on_exit(first, ExitReason::Killed("late".into()));
        settle().await;
        assert_eq!(sup.snapshot()[0].id.generation, first.generation + 1);
        assert_eq!(sup.ready_count(), 1);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_quarantines_and_reset_recovers() {
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let crashing = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            Err(ExecError::fail("boom"))
        });
        let sup = Supervisor::new(cfg(), crashing, bus);
        let _ = sup.start(1, 0, Duration::from_secs(1)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let info = &sup.snapshot()[0];
        assert_eq!(info.state, ProcessState::Quarantined);
        assert_eq!(info.restarts, 4);
        assert!(matches!(
            sup.dispatch(1).unwrap_err().error,
            SupervisorError::PoolDegraded { quarantined: 1 }
        ));

        let mut degraded = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::PoolDegraded {
                degraded += 1;
            }
        }
        assert_eq!(degraded, 1);

        // Stays quarantined.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sup.snapshot()[0].state, ProcessState::Quarantined);

        assert_eq!(
            sup.reset(5).await,
            Err(SupervisorError::UnknownSlot { slot: 5 })
        );
        let id = sup.reset(0).await.unwrap();
        assert_eq!(id.slot, 0);
        assert_eq!(id.generation, 5);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_exit_quarantines_immediately() {
        let fatal = ProcessFn::arc(|_ctx: ProcessContext<u32>| async move {
            Err(ExecError::fatal("bad config"))
        });
        let sup = Supervisor::new(cfg(), fatal, Bus::new(64));
        let _ = sup.start(1, 0, Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(sup.snapshot()[0].state, ProcessState::Quarantined);
        assert_eq!(
            sup.reset(0).await.map(|id| id.generation),
            Ok(2),
            "reset launches the next generation"
        );
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_work_is_rehomed() {
        let bus = Bus::new(256);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let process = ProcessFn::arc(move |ctx: ProcessContext<u32>| {
            let done = done_tx.clone();
            async move {
                ctx.ready();
                // slot 0 dies before reading its inbox
                if ctx.id().slot == 0 && ctx.id().generation == 1 {
                    ctx.token().cancelled().await;
                    return Err(ExecError::fail("crashed"));
                }
                while let Some(w) = ctx.recv().await {
                    let _ = done.send((ctx.id().slot, w));
                }
                Ok(())
            }
        });
        let sup = Supervisor::new(cfg(), process, bus);
        sup.start(2, 2, Duration::from_secs(1)).await.unwrap();

        let first = sup.dispatch(10).unwrap();
        let second = sup.dispatch(11).unwrap();
        let dead = if first.slot == 0 { first } else { second };
        let queued_on_dead = if first.slot == 0 { 10 } else { 11 };

        sup.on_exit(dead, ExitReason::Killed("test".into()));
        let mut seen = Vec::new();
        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(got);
        }
        assert!(seen.contains(&(1, queued_on_dead)));
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_stuck_process() {
        let stubborn = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            std::future::pending::<()>().await;
            Ok(())
        });
        let sup = Supervisor::new(cfg(), stubborn, Bus::new(64));
        sup.start(1, 1, Duration::from_secs(1)).await.unwrap();

        let err = sup.shutdown(Duration::from_millis(50)).await.unwrap_err();
        match err {
            SupervisorError::GraceExceeded { stuck, .. } => {
                assert_eq!(stuck, vec!["worker-0#1".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sup.shutdown(Duration::ZERO).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_kills_silent_process() {
        let silent = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            ctx.token().cancelled().await;
            Ok(())
        });
        let cfg = SupervisorConfig {
            heartbeat_timeout: Duration::from_millis(200),
            ..cfg()
        };
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg, silent, bus);
        sup.start(1, 1, Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut reasons = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::WorkerDied {
                reasons.push(ev.reason.as_deref().unwrap_or("").to_string());
            }
        }
        assert!(reasons.iter().any(|r| r.contains("heartbeat_timeout")));
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    fn reasons_of(events: &mut tokio::sync::broadcast::Receiver<Event>, kind: EventKind) -> Vec<String> {
        let mut reasons = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == kind {
                reasons.push(ev.reason.as_deref().unwrap_or("").to_string());
            }
        }
        reasons
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_that_never_becomes_ready_is_replaced() {
        let stalls_first = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            if ctx.id().generation == 1 {
                std::future::pending::<()>().await;
            }
            ctx.ready();
            while ctx.recv().await.is_some() {}
            Ok(())
        });
        let cfg = SupervisorConfig {
            ready_timeout: Duration::from_millis(200),
            ..cfg()
        };
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg, stalls_first, bus);
        sup.start(1, 0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sup.snapshot()[0].state, ProcessState::Starting);

        assert!(sup.wait_for_ready(1, Duration::from_secs(2)).await);
        let info = &sup.snapshot()[0];
        assert_eq!(info.id.generation, 2);
        assert_eq!(info.restarts, 1);

        let died = reasons_of(&mut rx, EventKind::WorkerDied);
        assert_eq!(died.len(), 1);
        assert!(died[0].contains("startup_timeout"), "{died:?}");
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_streak_resets_after_healthy_run() {
        let cfg = SupervisorConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(1),
                factor: 2.0,
                jitter: JitterPolicy::None,
            },
            reset_after: Duration::from_secs(5),
            ceiling: RestartCeiling::unlimited(),
            ..cfg()
        };
        let lives = Arc::new(AtomicUsize::new(0));
        let process = {
            let lives = Arc::clone(&lives);
            ProcessFn::arc(move |ctx: ProcessContext<u32>| {
                let life = lives.fetch_add(1, Ordering::SeqCst);
                async move {
                    ctx.ready();
                    match life {
                        0..=4 | 6..=7 => Err(ExecError::fail("crash")),
                        5 => {
                            tokio::time::sleep(Duration::from_secs(6)).await;
                            Err(ExecError::fail("crash after a healthy run"))
                        }
                        _ => {
                            while ctx.recv().await.is_some() {}
                            Ok(())
                        }
                    }
                }
            })
        };
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg, process, bus);
        let _ = sup.start(1, 0, Duration::from_secs(1)).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sup.snapshot()[0].state, ProcessState::Ready);
        assert_eq!(lives.load(Ordering::SeqCst), 9);

        let mut delays = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::RespawnScheduled {
                delays.push(ev.delay_ms.unwrap_or_default());
            }
        }
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 100, 200, 400]);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_held_outside_body_is_reported() {
        let hands_off = ProcessFn::arc(|ctx: ProcessContext<u32>| async move {
            ctx.ready();
            if ctx.id().generation == 1 {
                tokio::spawn(async move { while ctx.recv().await.is_some() {} });
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(ExecError::fail("inbox handed to a detached reader"));
            }
            while ctx.recv().await.is_some() {}
            Ok(())
        });
        let bus = Bus::new(256);
        let mut rx = bus.subscribe();
        let sup = Supervisor::new(cfg(), hands_off, bus);
        sup.start(1, 1, Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sup.wait_for_ready(1, Duration::from_secs(1)).await);
        assert_eq!(sup.snapshot()[0].id.generation, 2);

        let orphaned = reasons_of(&mut rx, EventKind::WorkOrphaned);
        assert_eq!(orphaned.len(), 1);
        assert!(orphaned[0].contains("inbox held"), "{orphaned:?}");
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
