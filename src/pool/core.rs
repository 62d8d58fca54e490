//! # Worker pool: bounded-concurrency execution of CPU-heavy work.
//!
//! ## Architecture
//! ```text
//! submit(payload, deadline) ──► Queue (high | normal | low)     never blocks on execution
//!                                  │
//!                     dispatcher: acquire slot permit ─► pop ─► begin (Queued → Running)
//!                                  │
//!                                  ▼
//!                      run_job (own tokio task, holds the permit)
//!                        ├─ token cancelled        → abandon, slot released
//!                        ├─ deadline elapsed       → Expired, DeadlineExceeded
//!                        └─ executor finished      → Completed | Failed | Cancelled
//! ```
//!
//! The number of slot permits is the bound on Running tasks. A task whose
//! deadline elapses is abandoned: its token is cancelled, its future dropped and
//! its permit returned, even if a blocking closure keeps running in the background.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use servevisor::{Bus, ExecFn, PoolConfig, WorkerPool};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let square = ExecFn::new(|n: u64, _ctx: CancellationToken| async move {
//!         Ok::<_, servevisor::ExecError>(n * n)
//!     });
//!     let pool = WorkerPool::new(PoolConfig::default(), square, Bus::default());
//!
//!     let task = pool.submit(7, Some(Duration::from_secs(1)))?;
//!     assert_eq!(task.wait().await?, 49);
//!
//!     pool.shutdown(Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{ExecError, PoolError, panic_message};
use crate::events::{Bus, Event, EventKind};
use crate::pool::config::PoolConfig;
use crate::pool::executor::Executor;
use crate::pool::queue::{PushError, Queue};
use crate::pool::task::{PoolStats, Priority, Registry, TaskCell, TaskHandle, TaskId, TaskState};

struct Job<E: Executor> {
    cell: Arc<TaskCell>,
    payload: E::Payload,
    reply: oneshot::Sender<Result<E::Output, PoolError>>,
}

struct Shared<E: Executor> {
    cfg: PoolConfig,
    executor: Arc<E>,
    registry: Arc<Registry>,
    queue: Queue<Job<E>>,
    slots: Arc<Semaphore>,
    root: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded-concurrency executor front-end.
///
/// Cheap to clone. Dropping the last clone stops the dispatcher and abandons
/// everything still queued or running.
pub struct WorkerPool<E: Executor> {
    shared: Arc<Shared<E>>,
    _alive: Arc<DropGuard>,
}

impl<E: Executor> Clone for WorkerPool<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _alive: Arc::clone(&self._alive),
        }
    }
}

impl<E: Executor> WorkerPool<E> {
    /// Creates the pool and spawns its dispatcher. Must be called within a tokio runtime.
    pub fn new(cfg: PoolConfig, executor: E, bus: Bus) -> Self {
        let root = CancellationToken::new();
        let registry = Arc::new(Registry::new(bus, cfg.retention()));
        let shared = Arc::new(Shared {
            slots: Arc::new(Semaphore::new(cfg.slots_clamped())),
            queue: Queue::new(cfg.max_queue_depth),
            executor: Arc::new(executor),
            registry: Arc::clone(&registry),
            root: root.clone(),
            dispatcher: Mutex::new(None),
            cfg,
        });

        let handle = tokio::spawn(dispatch_loop(Arc::clone(&shared)));
        *shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if let Some(retention) = shared.cfg.retention() {
            spawn_sweeper(registry, retention, root.child_token());
        }

        Self {
            shared,
            _alive: Arc::new(root.drop_guard()),
        }
    }

    /// Pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.cfg
    }

    /// Enqueues `payload` at normal priority. Returns immediately.
    ///
    /// `deadline` is relative to now; `None` falls back to the configured default.
    pub fn submit(
        &self,
        payload: E::Payload,
        deadline: Option<Duration>,
    ) -> Result<TaskHandle<E::Output>, PoolError> {
        self.submit_with(payload, deadline, Priority::Normal)
    }

    /// Enqueues `payload` at the given priority. Returns immediately.
    ///
    /// # Errors
    /// - [`PoolError::QueueFull`] when `max_queue_depth` tasks are already queued;
    ///   a `QueueFull` event is published.
    /// - [`PoolError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn submit_with(
        &self,
        payload: E::Payload,
        deadline: Option<Duration>,
        priority: Priority,
    ) -> Result<TaskHandle<E::Output>, PoolError> {
        let shared = &self.shared;
        if shared.root.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let deadline = deadline
            .or(shared.cfg.default_deadline())
            .map(|d| Instant::now() + d);
        let cell = shared
            .registry
            .register(shared.root.child_token(), deadline);
        let (reply, rx) = oneshot::channel();
        let job = Job {
            cell: Arc::clone(&cell),
            payload,
            reply,
        };

        match shared
            .queue
            .push(job, priority, |j| !j.cell.state().is_terminal())
        {
            Ok(()) => Ok(TaskHandle::new(cell, rx, Arc::clone(&shared.registry))),
            Err(PushError::Closed(_)) => {
                shared.registry.unregister(cell.id);
                Err(PoolError::Closed)
            }
            Err(PushError::Full(_)) => {
                shared.registry.unregister(cell.id);
                shared.registry.record_rejected();

                let depth = shared.cfg.max_queue_depth;
                tracing::debug!(depth, "worker pool queue full");
                shared.registry.bus().publish(
                    Event::new(EventKind::QueueFull)
                        .with_task(cell.id.0)
                        .with_reason(format!("depth={depth}")),
                );
                Err(PoolError::QueueFull {
                    depth,
                    retry_after: shared.cfg.queue_full_retry_after,
                })
            }
        }
    }

    /// Requests cooperative cancellation of a task. Idempotent.
    ///
    /// Returns `true` if this call cancelled it; `false` if it was already
    /// terminal or is no longer tracked.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.registry.cancel(id)
    }

    /// State of a tracked task. Tasks are forgotten once their handle observed the
    /// outcome, or after the retention window. With `retention = 0` a finished
    /// task is also forgotten as soon as its handle is dropped.
    pub fn status(&self, id: TaskId) -> Option<TaskState> {
        self.shared.registry.status(id)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.registry.stats(self.shared.queue.len())
    }

    /// Drops finished tasks older than the retention window; returns how many.
    pub fn sweep_finished(&self) -> usize {
        self.shared.registry.sweep(self.shared.cfg.retention)
    }

    /// Stops accepting work and waits up to `grace` for queued and running tasks.
    ///
    /// Whatever is still queued or running when `grace` elapses is cancelled.
    /// Returns the number of abandoned tasks (0 on a clean drain). Idempotent.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let shared = &self.shared;
        shared.queue.close();

        let mut dispatcher = shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let all = u32::try_from(shared.cfg.slots_clamped()).unwrap_or(u32::MAX);

        let drained = tokio::time::timeout(grace, async {
            if let Some(handle) = dispatcher.as_mut() {
                let _ = handle.await;
            }
            let _ = shared.slots.acquire_many(all).await;
        })
        .await
        .is_ok();

        let mut abandoned = 0;
        if !drained {
            abandoned += shared.registry.cancel_running();
        }
        shared.root.cancel();
        if let Some(handle) = dispatcher {
            handle.abort();
        }
        for job in shared.queue.drain() {
            if shared.registry.settle(&job.cell, TaskState::Cancelled) {
                job.cell.token.cancel();
                let _ = job.reply.send(Err(PoolError::Cancelled));
                abandoned += 1;
            }
        }
        shared.slots.close();

        if abandoned > 0 {
            tracing::warn!(abandoned, ?grace, "worker pool shutdown abandoned tasks");
        } else {
            tracing::debug!("worker pool drained");
        }
        abandoned
    }
}

async fn dispatch_loop<E: Executor>(shared: Arc<Shared<E>>) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            permit = Arc::clone(&shared.slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let job = tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            job = shared.queue.pop() => match job {
                Some(j) => j,
                None => break,
            },
        };

        // Settled while queued (cancelled or expired by its waiter).
        if !job.cell.begin() {
            continue;
        }
        if job.cell.deadline.is_some_and(|at| at <= Instant::now()) {
            if shared.registry.settle(&job.cell, TaskState::Expired) {
                job.cell.token.cancel();
                let _ = job.reply.send(Err(PoolError::DeadlineExceeded));
            }
            continue;
        }

        shared.registry.started();
        tokio::spawn(run_job(
            Arc::clone(&shared.executor),
            Arc::clone(&shared.registry),
            job,
            permit,
        ));
    }
}

async fn run_job<E: Executor>(
    executor: Arc<E>,
    registry: Arc<Registry>,
    job: Job<E>,
    _permit: OwnedSemaphorePermit,
) {
    let Job {
        cell,
        payload,
        reply,
    } = job;

    let deadline = cell.deadline;
    let expiry = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    let work = AssertUnwindSafe(executor.execute(payload, cell.token.clone())).catch_unwind();

    tokio::select! {
        biased;
        _ = cell.token.cancelled() => {}
        _ = expiry => {
            if registry.settle(&cell, TaskState::Expired) {
                cell.token.cancel();
                let _ = reply.send(Err(PoolError::DeadlineExceeded));
            }
        }
        res = work => {
            let (state, outcome) = match res {
                Ok(Ok(value)) => (TaskState::Completed, Ok(value)),
                Ok(Err(ExecError::Canceled)) => (TaskState::Cancelled, Err(PoolError::Cancelled)),
                Ok(Err(e)) => (TaskState::Failed, Err(PoolError::Failed { error: e.to_string() })),
                Err(panic) => {
                    let error = format!("panicked: {}", panic_message(&*panic));
                    tracing::warn!(task = %cell.id, %error, "executor panicked");
                    (TaskState::Failed, Err(PoolError::Failed { error }))
                }
            };
            if registry.settle(&cell, state) {
                let _ = reply.send(outcome);
            }
        }
    }
    registry.stopped();
}

fn spawn_sweeper(registry: Arc<Registry>, retention: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(retention);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let swept = registry.sweep(retention);
                    if swept > 0 {
                        tracing::trace!(swept, "swept finished tasks");
                    }
                }
            }
        }
    });
}
