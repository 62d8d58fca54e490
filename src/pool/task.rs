//! # Task records and handles.
//!
//! A task's state lives in a [`TaskCell`] shared by the pool, the executing job
//! and the caller's [`TaskHandle`]. Every terminal transition is a single
//! compare-and-swap, so exactly one party decides the outcome:
//!
//! ```text
//!            ┌──────────── cancel() / deadline ─────────────┐
//!            │                                              ▼
//! Queued ──► Running ──► Completed | Failed          Cancelled | Expired
//!   │                                                       ▲
//!   └────────────── cancel() / deadline / shutdown ─────────┘
//! ```
//!
//! The winner of the CAS owns the result slot: the executing job sends the
//! value, a waiter that expired returns `DeadlineExceeded` itself, and a losing
//! party discards what it has.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;
use crate::events::{Bus, Event, EventKind};

/// Identity of a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting for an execution slot.
    Queued = 0,
    /// Occupying an execution slot.
    Running = 1,
    /// Executor returned a value.
    Completed = 2,
    /// Executor returned an error or panicked.
    Failed = 3,
    /// Cancelled by the caller or by pool shutdown.
    Cancelled = 4,
    /// Deadline elapsed before a result was produced; the work was abandoned.
    Expired = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            _ => TaskState::Expired,
        }
    }

    /// True once the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// Scheduling priority. Higher priorities drain first; FIFO within a priority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Drained before everything else.
    High,
    /// Default priority.
    #[default]
    Normal,
    /// Drained last.
    Low,
}

/// Shared state of one task.
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    state: AtomicU8,
    pub(crate) token: CancellationToken,
    pub(crate) deadline: Option<Instant>,
    pub(crate) submitted_at: Instant,
    finished_at: OnceLock<Instant>,
    /// Set once the caller's handle is gone.
    detached: AtomicBool,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::Queued as u8),
            token,
            deadline,
            submitted_at: Instant::now(),
            finished_at: OnceLock::new(),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Queued → Running`; fails if the task was settled while queued.
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Queued as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves a live task to `to`. Returns `false` if it was already terminal.
    fn settle(&self, to: TaskState) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if TaskState::from_u8(cur).is_terminal() {
                return false;
            }
            match self
                .state
                .compare_exchange(cur, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let _ = self.finished_at.set(Instant::now());
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn finished_before(&self, cutoff: Instant) -> bool {
        self.finished_at.get().is_some_and(|at| *at <= cutoff)
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks waiting for a slot.
    pub queued: usize,
    /// Tasks occupying a slot.
    pub running: usize,
    /// Accepted submissions.
    pub submitted: u64,
    /// Submissions refused with `QueueFull`.
    pub rejected: u64,
    /// Tasks that completed.
    pub completed: u64,
    /// Tasks that failed.
    pub failed: u64,
    /// Tasks that were cancelled.
    pub cancelled: u64,
    /// Tasks that missed their deadline.
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
}

/// Tasks that have not been observed or swept yet, plus the counters.
pub(crate) struct Registry {
    tasks: DashMap<TaskId, Arc<TaskCell>>,
    /// Without a retention window nothing sweeps, so finished tasks whose
    /// handle was dropped are forgotten right away.
    forget_detached: bool,
    counters: Counters,
    running: AtomicUsize,
    next_id: AtomicU64,
    bus: Bus,
}

impl Registry {
    pub(crate) fn new(bus: Bus, retention: Option<Duration>) -> Self {
        Self {
            tasks: DashMap::new(),
            forget_detached: retention.is_none(),
            counters: Counters::default(),
            running: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn register(&self, token: CancellationToken, deadline: Option<Instant>) -> Arc<TaskCell> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(TaskCell::new(id, token, deadline));
        self.tasks.insert(id, Arc::clone(&cell));
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        cell
    }

    /// Drops a task that never made it into the queue.
    pub(crate) fn unregister(&self, id: TaskId) {
        self.tasks.remove(&id);
        self.counters.submitted.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stopped(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Terminal transition plus bookkeeping. Only the winner gets `true`.
    pub(crate) fn settle(&self, cell: &TaskCell, to: TaskState) -> bool {
        if !cell.settle(to) {
            return false;
        }
        let counter = match to {
            TaskState::Completed => &self.counters.completed,
            TaskState::Failed => &self.counters.failed,
            TaskState::Cancelled => &self.counters.cancelled,
            TaskState::Expired => {
                tracing::debug!(task = %cell.id, "task deadline exceeded");
                self.bus
                    .publish(Event::new(EventKind::TaskDeadlineExceeded).with_task(cell.id.0));
                &self.counters.expired
            }
            TaskState::Queued | TaskState::Running => return true,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.forget_detached {
            // Pairs with the fence in `detach`: one of the two sides sees the other.
            fence(Ordering::SeqCst);
            if cell.detached.load(Ordering::Relaxed) {
                self.forget(cell.id);
            }
        }
        true
    }

    /// Marks the caller's handle as gone.
    fn detach(&self, cell: &TaskCell) {
        if !self.forget_detached {
            return;
        }
        cell.detached.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if cell.state().is_terminal() {
            self.forget(cell.id);
        }
    }

    /// Cancels a live task. Idempotent: `false` when it was already terminal or unknown.
    pub(crate) fn cancel(&self, id: TaskId) -> bool {
        let Some(cell) = self.tasks.get(&id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        self.cancel_cell(&cell)
    }

    fn cancel_cell(&self, cell: &TaskCell) -> bool {
        if self.settle(cell, TaskState::Cancelled) {
            cell.token.cancel();
            true
        } else {
            false
        }
    }

    /// Cancels every running task; returns how many were cancelled.
    pub(crate) fn cancel_running(&self) -> usize {
        let running: Vec<Arc<TaskCell>> = self
            .tasks
            .iter()
            .filter(|c| c.state() == TaskState::Running)
            .map(|c| Arc::clone(c.value()))
            .collect();
        running.iter().filter(|c| self.cancel_cell(c)).count()
    }

    pub(crate) fn status(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|c| c.state())
    }

    pub(crate) fn forget(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    /// Removes terminal tasks finished more than `retention` ago.
    pub(crate) fn sweep(&self, retention: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(retention) else {
            return 0;
        };
        let before = self.tasks.len();
        self.tasks.retain(|_, cell| !cell.finished_before(cutoff));
        before.saturating_sub(self.tasks.len())
    }

    pub(crate) fn stats(&self, queued: usize) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            queued,
            running: self.running.load(Ordering::Acquire),
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }
}

/// Caller's handle to a submitted task.
///
/// Dropping the handle does not cancel the task. With no retention window
/// the task stops being tracked once it has finished and its handle is dropped.
pub struct TaskHandle<R> {
    cell: Arc<TaskCell>,
    rx: oneshot::Receiver<Result<R, PoolError>>,
    registry: Arc<Registry>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(
        cell: Arc<TaskCell>,
        rx: oneshot::Receiver<Result<R, PoolError>>,
        registry: Arc<Registry>,
    ) -> Self {
        Self { cell, rx, registry }
    }

    /// Task identity.
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.cell.deadline
    }

    /// Time since submission.
    pub fn age(&self) -> Duration {
        self.cell.submitted_at.elapsed()
    }

    /// Requests cooperative cancellation. Idempotent; no-op once terminal.
    ///
    /// Returns `true` if this call cancelled the task.
    pub fn cancel(&self) -> bool {
        self.registry.cancel_cell(&self.cell)
    }

    /// Waits for the outcome.
    ///
    /// Returns when the task completes, fails or is cancelled, or when its
    /// deadline elapses. On deadline the task is abandoned: its token is
    /// cancelled and its slot is released without waiting for the executor.
    pub async fn wait(mut self) -> Result<R, PoolError> {
        let deadline = self.cell.deadline;
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            res = &mut self.rx => res.unwrap_or_else(|_| Err(self.lost_result())),
            _ = self.cell.token.cancelled() => self.after_cancel().await,
            _ = expiry => {
                if self.registry.settle(&self.cell, TaskState::Expired) {
                    self.cell.token.cancel();
                    Err(PoolError::DeadlineExceeded)
                } else {
                    self.after_cancel().await
                }
            }
        };
        self.registry.forget(self.cell.id);
        outcome
    }

    /// Outcome once someone else settled the task.
    async fn after_cancel(&mut self) -> Result<R, PoolError> {
        match self.cell.state() {
            TaskState::Cancelled => Err(PoolError::Cancelled),
            TaskState::Expired => Err(PoolError::DeadlineExceeded),
            _ => (&mut self.rx)
                .await
                .unwrap_or_else(|_| Err(self.lost_result())),
        }
    }

    fn lost_result(&self) -> PoolError {
        match self.cell.state() {
            TaskState::Cancelled => PoolError::Cancelled,
            TaskState::Expired => PoolError::DeadlineExceeded,
            _ => PoolError::Closed,
        }
    }
}

impl<R> Drop for TaskHandle<R> {
    fn drop(&mut self) {
        self.registry.detach(&self.cell);
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("state", &self.cell.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> TaskCell {
        TaskCell::new(TaskId(1), CancellationToken::new(), None)
    }

    #[test]
    fn test_exactly_one_settle_wins() {
        let registry = Registry::new(Bus::new(8), None);
        let c = cell();
        assert!(c.begin());
        assert!(registry.settle(&c, TaskState::Completed));
        assert!(!registry.settle(&c, TaskState::Cancelled));
        assert!(!registry.settle(&c, TaskState::Expired));
        assert_eq!(c.state(), TaskState::Completed);
        assert_eq!(registry.stats(0).completed, 1);
        assert_eq!(registry.stats(0).cancelled, 0);
    }

    #[test]
    fn test_begin_fails_after_cancel() {
        let registry = Registry::new(Bus::new(8), None);
        let c = cell();
        assert!(registry.cancel_cell(&c));
        assert!(c.token.is_cancelled());
        assert!(!c.begin());
        assert!(!registry.cancel_cell(&c), "second cancel is a no-op");
    }

    #[test]
    fn test_expired_publishes_event() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let registry = Registry::new(bus, None);
        let c = cell();
        assert!(registry.settle(&c, TaskState::Expired));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, EventKind::TaskDeadlineExceeded);
        assert_eq!(ev.task, Some(1));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_retention() {
        let registry = Registry::new(Bus::new(8), None);
        let a = registry.register(CancellationToken::new(), None);
        let _b = registry.register(CancellationToken::new(), None);
        assert!(registry.settle(&a, TaskState::Completed));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.sweep(Duration::from_secs(60)), 0);
        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);
        assert_eq!(registry.status(a.id), None);
    }

    fn handle(registry: &Arc<Registry>) -> (TaskHandle<u32>, oneshot::Sender<Result<u32, PoolError>>) {
        let (tx, rx) = oneshot::channel();
        let cell = registry.register(CancellationToken::new(), None);
        (TaskHandle::new(cell, rx, Arc::clone(registry)), tx)
    }

    #[test]
    fn test_dropped_handle_is_forgotten_without_retention() {
        let registry = Arc::new(Registry::new(Bus::new(8), None));

        // Finished first, handle dropped after.
        let (done, _tx) = handle(&registry);
        let done_id = done.id();
        assert!(registry.settle(&done.cell, TaskState::Completed));
        assert_eq!(registry.status(done_id), Some(TaskState::Completed));
        drop(done);
        assert_eq!(registry.status(done_id), None);

        // Handle dropped first, finished after.
        let (early, _tx) = handle(&registry);
        let cell = Arc::clone(&early.cell);
        drop(early);
        assert_eq!(registry.status(cell.id), Some(TaskState::Queued));
        assert!(cell.begin());
        assert!(registry.settle(&cell, TaskState::Failed));
        assert_eq!(registry.status(cell.id), None);
    }

    #[test]
    fn test_dropped_handle_is_kept_for_retention() {
        let registry = Arc::new(Registry::new(Bus::new(8), Some(Duration::from_secs(60))));
        let (h, _tx) = handle(&registry);
        let id = h.id();
        assert!(registry.settle(&h.cell, TaskState::Completed));
        drop(h);
        assert_eq!(registry.status(id), Some(TaskState::Completed));
    }
}
