//! # Executors: the code a worker pool runs.
//!
//! An [`Executor`] turns one payload into one output. Each call receives a
//! [`CancellationToken`] that is cancelled when the task is cancelled or misses
//! its deadline; long computations should poll it at safe points.
//!
//! - [`ExecFn`] wraps an async closure.
//! - [`BlockingFn`] wraps a synchronous closure and runs it on tokio's blocking
//!   thread pool, keeping CPU-heavy work off the async workers.
//!
//! ## Example
//! ```rust
//! use tokio_util::sync::CancellationToken;
//! use servevisor::{BlockingFn, ExecError, ExecFn};
//!
//! let hash: BlockingFn<_, Vec<u8>, u64> = BlockingFn::new(|input: Vec<u8>, ctx: &CancellationToken| {
//!     let mut acc = 0u64;
//!     for chunk in input.chunks(4096) {
//!         if ctx.is_cancelled() {
//!             return Err(ExecError::Canceled);
//!         }
//!         acc = chunk.iter().fold(acc, |a, b| a.rotate_left(5) ^ u64::from(*b));
//!     }
//!     Ok(acc)
//! });
//!
//! let double: ExecFn<_, u64, u64> = ExecFn::new(|n: u64, _ctx: CancellationToken| async move { Ok::<_, ExecError>(n * 2) });
//! # let _ = (hash, double);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Unit-of-work contract for a [`WorkerPool`](crate::WorkerPool).
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Input of one task.
    type Payload: Send + 'static;
    /// Result of one task.
    type Output: Send + 'static;

    /// Executes one task.
    async fn execute(
        &self,
        payload: Self::Payload,
        ctx: CancellationToken,
    ) -> Result<Self::Output, ExecError>;
}

/// Async-closure executor.
pub struct ExecFn<F, P, R> {
    f: F,
    _io: PhantomData<fn(P) -> R>,
}

impl<F, P, R> ExecFn<F, P, R> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _io: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, P, R> Executor for ExecFn<F, P, R>
where
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ExecError>> + Send + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    type Payload = P;
    type Output = R;

    async fn execute(&self, payload: P, ctx: CancellationToken) -> Result<R, ExecError> {
        (self.f)(payload, ctx).await
    }
}

/// Synchronous-closure executor for CPU-bound work.
pub struct BlockingFn<F, P, R> {
    f: Arc<F>,
    _io: PhantomData<fn(P) -> R>,
}

impl<F, P, R> BlockingFn<F, P, R> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            _io: PhantomData,
        }
    }
}

#[async_trait]
impl<F, P, R> Executor for BlockingFn<F, P, R>
where
    F: Fn(P, &CancellationToken) -> Result<R, ExecError> + Send + Sync + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    type Payload = P;
    type Output = R;

    async fn execute(&self, payload: P, ctx: CancellationToken) -> Result<R, ExecError> {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(payload, &ctx)).await {
            Ok(res) => res,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(ExecError::Canceled),
        }
    }
}
