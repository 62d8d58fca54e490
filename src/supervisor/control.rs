//! # Supervisor control loop.
//!
//! The control loop is the only writer of the process table. Everything that
//! changes a slot arrives as a [`Control`] message:
//!
//! ```text
//! ProcessContext ── Ready / Heartbeat ───────────┐
//! process host   ── Exited { reason, orphans } ──┤
//! Supervisor     ── Exited (synthetic) / Reset ──┼──► ControlLoop::run ──► table (RwLock, write)
//!                ── Drain / Stop ────────────────┤          │
//! respawn timer  ── Respawn { slot, generation } ┘          ├──► Bus (WorkerSpawned, WorkerDied, ...)
//!                                                           └──► watch<ready count>
//! ```
//!
//! ## Rules
//! - Messages carrying an older generation than the slot's current one are stale
//!   and ignored (their orphaned work is still re-homed).
//! - A death inside a failure streak doubles the respawn delay; a process that
//!   stayed ready for `reset_after` starts a new streak.
//! - Going over the restart ceiling, or exiting with a fatal error, quarantines
//!   the slot: no respawn until `reset`.
//! - Once draining, deaths are recorded but never respawned.
//! - A process still `Starting` after `ready_timeout`, or `Ready` and silent for
//!   `heartbeat_timeout`, is killed and handled like any other death.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{SupervisorError, panic_message};
use crate::events::{Bus, Event, EventKind};
use crate::policies::RestartHistory;
use crate::supervisor::config::SupervisorConfig;
use crate::supervisor::process::{
    ExitReason, ProcessContext, ProcessInfo, ProcessRef, ProcessState, WorkerId,
};

/// Messages consumed by the control loop.
pub(crate) enum Control<W> {
    Ready(WorkerId),
    Heartbeat(WorkerId),
    Exited {
        id: WorkerId,
        reason: ExitReason,
        orphans: Vec<W>,
        /// The inbox was locked by a task outside the body; its queue could not be read.
        inbox_held: bool,
    },
    Respawn {
        slot: usize,
        generation: u64,
    },
    Reset {
        slot: usize,
        reply: oneshot::Sender<Result<WorkerId, SupervisorError>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<(WorkerId, JoinHandle<()>)>>,
    },
    Stop,
}

/// One slot of the process table.
pub(crate) struct SlotRecord<W> {
    pub(crate) id: WorkerId,
    /// Stored state; `Busy` is derived from `load` when observed.
    pub(crate) state: ProcessState,
    pub(crate) inbox: Option<mpsc::Sender<W>>,
    pub(crate) load: Arc<AtomicUsize>,
    pub(crate) restarts: u32,
    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) backoff_until: Option<Instant>,
    launched_at: Option<Instant>,
    ready_at: Option<Instant>,
    consecutive: u32,
    history: RestartHistory,
    token: CancellationToken,
    kill: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl<W> SlotRecord<W> {
    fn empty(slot: usize) -> Self {
        Self {
            id: WorkerId {
                slot,
                generation: 0,
            },
            state: ProcessState::Dead,
            inbox: None,
            load: Arc::new(AtomicUsize::new(0)),
            restarts: 0,
            last_heartbeat: None,
            backoff_until: None,
            launched_at: None,
            ready_at: None,
            consecutive: 0,
            history: RestartHistory::default(),
            token: CancellationToken::new(),
            kill: CancellationToken::new(),
            join: None,
        }
    }

    fn in_flight(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub(crate) fn info(&self) -> ProcessInfo {
        let in_flight = self.in_flight();
        let state = match self.state {
            ProcessState::Ready if in_flight > 0 => ProcessState::Busy,
            s => s,
        };
        ProcessInfo {
            id: self.id,
            state,
            restarts: self.restarts,
            last_heartbeat: self.last_heartbeat,
            backoff_until: self.backoff_until,
            in_flight,
        }
    }
}

pub(crate) type Table<W> = Arc<RwLock<Vec<SlotRecord<W>>>>;

pub(crate) fn read<W>(table: &Table<W>) -> RwLockReadGuard<'_, Vec<SlotRecord<W>>> {
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<W>(table: &Table<W>) -> RwLockWriteGuard<'_, Vec<SlotRecord<W>>> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}

fn release(load: &AtomicUsize) {
    let _ = load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(1))
    });
}

/// Forwards `work` to the least-loaded ready process without blocking.
///
/// Candidates are visited starting at `cursor` so equally loaded processes
/// take turns. The work comes back if every inbox is full or closed.
pub(crate) fn route<W>(table: &[SlotRecord<W>], cursor: usize, work: W) -> Result<WorkerId, W> {
    let n = table.len();
    if n == 0 {
        return Err(work);
    }
    let start = cursor % n;
    let mut order: Vec<usize> = (0..n)
        .map(|i| (start + i) % n)
        .filter(|&i| table[i].state.accepts_work())
        .collect();
    order.sort_by_key(|&i| table[i].in_flight());

    let mut work = work;
    for i in order {
        let rec = &table[i];
        let Some(inbox) = &rec.inbox else { continue };
        rec.load.fetch_add(1, Ordering::AcqRel);
        match inbox.try_send(work) {
            Ok(()) => return Ok(rec.id),
            Err(TrySendError::Full(w) | TrySendError::Closed(w)) => {
                release(&rec.load);
                work = w;
            }
        }
    }
    Err(work)
}

/// Suggested delay before retrying a dispatch that found no capacity.
pub(crate) fn retry_after<W>(table: &[SlotRecord<W>], cfg: &SupervisorConfig) -> Duration {
    let now = Instant::now();
    table
        .iter()
        .filter(|r| r.state == ProcessState::Dead)
        .filter_map(|r| r.backoff_until)
        .map(|at| at.saturating_duration_since(now))
        .min()
        .unwrap_or(cfg.backoff.base)
        .max(Duration::from_millis(1))
}

fn process_event(kind: EventKind, id: WorkerId) -> Event {
    Event::new(kind).with_worker(id.to_string()).with_slot(id.slot)
}

/// Hosts one incarnation: runs the body, converts its outcome into an
/// [`ExitReason`], and hands queued work back to the control loop.
async fn host<W: Send + 'static>(
    process: ProcessRef<W>,
    ctx: ProcessContext<W>,
    inbox: Arc<Mutex<mpsc::Receiver<W>>>,
    kill: CancellationToken,
    control: mpsc::UnboundedSender<Control<W>>,
) {
    let id = ctx.id();
    let reason = tokio::select! {
        biased;
        _ = kill.cancelled() => ExitReason::Killed("terminated by supervisor".to_string()),
        res = AssertUnwindSafe(process.run(ctx)).catch_unwind() => match res {
            Ok(res) => ExitReason::from_result(res),
            Err(panic) => ExitReason::Panicked(panic_message(&*panic)),
        },
    };

    let mut orphans = Vec::new();
    let inbox_held = match inbox.try_lock() {
        Ok(mut rx) => {
            rx.close();
            while let Ok(work) = rx.try_recv() {
                orphans.push(work);
            }
            false
        }
        Err(_) => true,
    };
    let _ = control.send(Control::Exited {
        id,
        reason,
        orphans,
        inbox_held,
    });
}

pub(crate) struct ControlLoop<W> {
    cfg: SupervisorConfig,
    process: ProcessRef<W>,
    bus: Bus,
    table: Table<W>,
    tx: mpsc::UnboundedSender<Control<W>>,
    root: CancellationToken,
    ready: watch::Sender<usize>,
    cursor: Arc<AtomicUsize>,
    draining: bool,
}

impl<W: Send + 'static> ControlLoop<W> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: SupervisorConfig,
        process: ProcessRef<W>,
        bus: Bus,
        table: Table<W>,
        tx: mpsc::UnboundedSender<Control<W>>,
        root: CancellationToken,
        ready: watch::Sender<usize>,
        cursor: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            cfg,
            process,
            bus,
            table,
            tx,
            root,
            ready,
            cursor,
            draining: false,
        }
    }

    /// Creates `pool_size` slots and launches a process into each.
    pub(crate) fn fill(&self, pool_size: usize) {
        let mut table = write(&self.table);
        table.clear();
        for slot in 0..pool_size {
            let mut rec = SlotRecord::empty(slot);
            self.launch(&mut rec);
            table.push(rec);
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Control<W>>) {
        let mut ticker = self.cfg.liveness_period().map(|period| {
            let mut t = tokio::time::interval(period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        loop {
            let msg = match ticker.as_mut() {
                Some(t) => tokio::select! {
                    msg = rx.recv() => msg,
                    _ = t.tick() => {
                        self.check_liveness();
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            let Some(msg) = msg else { break };

            match msg {
                Control::Ready(id) => self.on_ready(id),
                Control::Heartbeat(id) => self.on_heartbeat(id),
                Control::Exited {
                    id,
                    reason,
                    orphans,
                    inbox_held,
                } => self.on_exit(id, reason, orphans, inbox_held),
                Control::Respawn { slot, generation } => self.on_respawn(slot, generation),
                Control::Reset { slot, reply } => {
                    let _ = reply.send(self.on_reset(slot));
                }
                Control::Drain { reply } => {
                    let _ = reply.send(self.on_drain());
                }
                Control::Stop => break,
            }
        }
        self.finish();
    }

    fn launch(&self, rec: &mut SlotRecord<W>) {
        let id = WorkerId {
            slot: rec.id.slot,
            generation: rec.id.generation + 1,
        };
        let (tx, rx) = mpsc::channel(self.cfg.inbox_capacity_clamped());
        let inbox = Arc::new(Mutex::new(rx));
        let token = self.root.child_token();
        let kill = CancellationToken::new();
        let load = Arc::new(AtomicUsize::new(0));

        let ctx = ProcessContext::new(
            id,
            Arc::clone(&inbox),
            self.tx.clone(),
            token.clone(),
            Arc::clone(&load),
        );
        let join = tokio::spawn(host(
            Arc::clone(&self.process),
            ctx,
            inbox,
            kill.clone(),
            self.tx.clone(),
        ));

        rec.id = id;
        rec.state = ProcessState::Starting;
        rec.inbox = Some(tx);
        rec.load = load;
        rec.last_heartbeat = None;
        rec.backoff_until = None;
        rec.launched_at = Some(Instant::now());
        rec.ready_at = None;
        rec.token = token;
        rec.kill = kill;
        rec.join = Some(join);

        tracing::debug!(worker = %id, restarts = rec.restarts, "worker process launched");
        self.bus
            .publish(process_event(EventKind::WorkerSpawned, id).with_restarts(rec.restarts));
    }

    fn publish_ready_count(&self, table: &[SlotRecord<W>]) {
        let ready = table
            .iter()
            .filter(|r| r.state == ProcessState::Ready)
            .count();
        self.ready.send_replace(ready);
    }

    fn on_ready(&self, id: WorkerId) {
        let mut table = write(&self.table);
        let Some(rec) = table.get_mut(id.slot).filter(|r| r.id == id) else {
            return;
        };
        let now = Instant::now();
        rec.last_heartbeat = Some(now);
        if rec.state == ProcessState::Starting {
            rec.state = ProcessState::Ready;
            rec.ready_at = Some(now);
            self.bus.publish(process_event(EventKind::WorkerReady, id));
            self.publish_ready_count(&table);
        }
    }

    fn on_heartbeat(&self, id: WorkerId) {
        let mut table = write(&self.table);
        if let Some(rec) = table.get_mut(id.slot).filter(|r| r.id == id) {
            if matches!(
                rec.state,
                ProcessState::Starting | ProcessState::Ready | ProcessState::Draining
            ) {
                rec.last_heartbeat = Some(Instant::now());
            }
        }
    }

    fn on_exit(&self, id: WorkerId, reason: ExitReason, orphans: Vec<W>, inbox_held: bool) {
        let now = Instant::now();
        {
            let mut table = write(&self.table);
            if id.slot >= table.len() {
                drop(table);
                self.rehome(id, orphans, inbox_held);
                return;
            }
            let rec = &mut table[id.slot];
            let live = rec.id == id
                && matches!(
                    rec.state,
                    ProcessState::Starting | ProcessState::Ready | ProcessState::Draining
                );
            if live {
                rec.state = ProcessState::Dead;
                rec.inbox = None;
                rec.join = None;
                rec.kill.cancel();
                rec.token.cancel();
                let healthy_since = rec.ready_at.take();

                if self.draining {
                    self.bus.publish(
                        process_event(EventKind::WorkerDied, id)
                            .with_reason(reason.to_string())
                            .with_restarts(rec.restarts),
                    );
                } else {
                    rec.restarts = rec.restarts.saturating_add(1);
                    let healthy = match (self.cfg.reset_after(), healthy_since) {
                        (Some(threshold), Some(since)) => {
                            now.saturating_duration_since(since) >= threshold
                        }
                        _ => false,
                    };
                    rec.consecutive = if healthy {
                        1
                    } else {
                        rec.consecutive.saturating_add(1)
                    };
                    let over_ceiling = rec.history.record(now, &self.cfg.ceiling);

                    self.bus.publish(
                        process_event(EventKind::WorkerDied, id)
                            .with_reason(reason.to_string())
                            .with_restarts(rec.restarts),
                    );

                    if reason.is_fatal() || over_ceiling {
                        rec.state = ProcessState::Quarantined;
                        rec.backoff_until = None;
                        let why = if reason.is_fatal() {
                            format!("fatal exit: {reason}")
                        } else {
                            format!(
                                "restart ceiling exceeded ({} deaths within {:?})",
                                rec.history.len(),
                                self.cfg.ceiling.window
                            )
                        };
                        tracing::warn!(slot = id.slot, restarts = rec.restarts, reason = %why, "slot quarantined");
                        self.bus.publish(
                            Event::new(EventKind::PoolDegraded)
                                .with_slot(id.slot)
                                .with_restarts(rec.restarts)
                                .with_reason(why),
                        );
                    } else {
                        let delay = self.cfg.backoff.next(rec.consecutive);
                        rec.backoff_until = Some(now + delay);
                        self.bus.publish(
                            process_event(EventKind::RespawnScheduled, id)
                                .with_delay(delay)
                                .with_restarts(rec.restarts),
                        );
                        self.schedule_respawn(id, delay);
                    }
                }
                self.publish_ready_count(&table);
            }
        }
        self.rehome(id, orphans, inbox_held);
    }

    fn schedule_respawn(&self, dead: WorkerId, delay: Duration) {
        let tx = self.tx.clone();
        let root = self.root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Control::Respawn { slot: dead.slot, generation: dead.generation });
                }
                _ = root.cancelled() => {}
            }
        });
    }

    fn on_respawn(&self, slot: usize, generation: u64) {
        if self.draining {
            return;
        }
        let mut table = write(&self.table);
        if let Some(rec) = table.get_mut(slot) {
            if rec.id.generation == generation && rec.state == ProcessState::Dead {
                self.launch(rec);
            }
        }
    }

    fn on_reset(&self, slot: usize) -> Result<WorkerId, SupervisorError> {
        if self.draining {
            return Err(SupervisorError::ShuttingDown);
        }
        let mut table = write(&self.table);
        let rec = table
            .get_mut(slot)
            .ok_or(SupervisorError::UnknownSlot { slot })?;
        if rec.state != ProcessState::Quarantined {
            return Err(SupervisorError::NotQuarantined { slot });
        }
        rec.history.clear();
        rec.consecutive = 0;
        rec.restarts = 0;
        self.launch(rec);
        tracing::info!(worker = %rec.id, "quarantined slot reset by operator");
        Ok(rec.id)
    }

    fn on_drain(&mut self) -> Vec<(WorkerId, JoinHandle<()>)> {
        self.draining = true;
        self.root.cancel();

        let mut table = write(&self.table);
        let mut handles = Vec::new();
        for rec in table.iter_mut() {
            if matches!(rec.state, ProcessState::Starting | ProcessState::Ready) {
                rec.state = ProcessState::Draining;
                rec.inbox = None;
            }
            rec.backoff_until = None;
            if let Some(join) = rec.join.take() {
                handles.push((rec.id, join));
            }
        }
        self.publish_ready_count(&table);
        handles
    }

    /// Kills processes that missed their readiness or heartbeat deadline.
    fn check_liveness(&self) {
        let heartbeat = self.cfg.heartbeat_timeout();
        let startup = self.cfg.ready_timeout();
        let now = Instant::now();
        let overdue: Vec<(WorkerId, &'static str, Duration)> = read(&self.table)
            .iter()
            .filter_map(|r| {
                let (since, limit, why) = match r.state {
                    ProcessState::Starting => (r.launched_at?, startup?, "startup_timeout"),
                    ProcessState::Ready => (r.last_heartbeat?, heartbeat?, "heartbeat_timeout"),
                    _ => return None,
                };
                (now.saturating_duration_since(since) > limit).then_some((r.id, why, limit))
            })
            .collect();

        for (id, why, timeout) in overdue {
            tracing::warn!(worker = %id, ?timeout, reason = why, "liveness deadline missed");
            self.on_exit(id, ExitReason::Killed(why.to_string()), Vec::new(), false);
        }
    }

    /// Re-dispatches work left in a dead process's inbox.
    fn rehome(&self, from: WorkerId, orphans: Vec<W>, inbox_held: bool) {
        if inbox_held {
            tracing::warn!(worker = %from, "inbox held by another task; queued work not re-homed");
            self.bus.publish(
                process_event(EventKind::WorkOrphaned, from)
                    .with_reason("inbox held by another task; queued work not re-homed"),
            );
        }
        if orphans.is_empty() {
            return;
        }
        let total = orphans.len();
        let mut lost = 0usize;
        {
            let table = read(&self.table);
            for work in orphans {
                if self.draining {
                    lost += 1;
                    continue;
                }
                let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
                if route(&table, cursor, work).is_err() {
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            tracing::warn!(worker = %from, lost, total, "queued work could not be re-homed");
            self.bus.publish(
                process_event(EventKind::WorkOrphaned, from)
                    .with_reason(format!("{lost} of {total} queued item(s) lost")),
            );
        }
    }

    fn finish(&self) {
        let mut table = write(&self.table);
        for rec in table.iter_mut() {
            if rec.state == ProcessState::Draining {
                rec.state = ProcessState::Dead;
            }
            rec.inbox = None;
        }
        self.publish_ready_count(&table);
    }
}
