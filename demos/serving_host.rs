//! # Example: serving_host
//!
//! A request-serving host built from every component of the core.
//!
//! Shows how to:
//! - Host a [`Pipeline`] inside supervised worker processes.
//! - Route requests with [`Supervisor::dispatch`] and retry on `NoCapacity`.
//! - Attach the built-in [`LogWriter`] through a [`SubscriberSet`].
//! - Drain everything on shutdown.
//!
//! ## Flow
//! ```text
//! main ──► Supervisor::dispatch(Request)
//!              └─► worker process (ctx.recv)
//!                    └─► Pipeline::serve
//!                          ├─► RateLimiter   (per caller)
//!                          ├─► Cache         (per page, single-flight)
//!                          └─► WorkerPool    (render with deadline)
//! Bus ──► SubscriberSet ──► LogWriter ──► tracing
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=info cargo run --example serving_host --features logging
//! ```

use std::sync::Arc;
use std::time::Duration;

use servevisor::{
    BucketConfig, Config, ExecError, ExecFn, LogWriter, Pipeline, ProcessContext, ProcessFn,
    ServeError, Subscribe, SubscriberSet, Supervisor, SupervisorError,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// One inbound request plus the channel its answer goes back on.
struct Request {
    caller: &'static str,
    page: u32,
    reply: oneshot::Sender<Result<String, ServeError>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = Config::default();
    cfg.supervisor.pool_size = 3;
    cfg.supervisor.min_ready = 2;
    cfg.pool.slots = 2;
    cfg.cache.default_ttl = Duration::from_secs(30);
    cfg.limiter.default = BucketConfig::new(4, 2.0);

    let bus = cfg.bus();
    let stop = CancellationToken::new();
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let subs = Arc::new(SubscriberSet::new(subs, bus.clone()));
    let listener = subs.spawn_listener(&bus, stop.clone());

    let render = ExecFn::new(|page: u32, ctx: CancellationToken| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(150)) => {
                Ok::<_, ExecError>(format!("<h1>page {page}</h1>"))
            }
            _ = ctx.cancelled() => Err(ExecError::Canceled),
        }
    });
    let pipeline = Pipeline::from_config(&cfg, render, bus.clone())
        .with_deadline(Duration::from_secs(1));

    let host = {
        let pipeline = pipeline.clone();
        ProcessFn::arc(move |ctx: ProcessContext<Request>| {
            let pipeline = pipeline.clone();
            async move {
                ctx.ready();
                while let Some(req) = ctx.recv().await {
                    let res = pipeline.serve(req.caller, req.page, req.page).await;
                    let _ = req.reply.send(res);
                    ctx.heartbeat();
                }
                Ok(())
            }
        })
    };
    let sup = Supervisor::new(cfg.supervisor.clone(), host, bus.clone());
    sup.launch().await?;

    let mut pending = Vec::new();
    for (n, caller) in ["alice", "alice", "bob", "alice", "alice", "alice", "carol"]
        .into_iter()
        .enumerate()
    {
        let (tx, rx) = oneshot::channel();
        let mut req = Request {
            caller,
            page: (n % 2) as u32,
            reply: tx,
        };
        loop {
            match sup.dispatch(req) {
                Ok(_) => break,
                Err(rejected) => match rejected.error {
                    SupervisorError::NoCapacity { retry_after } => {
                        tokio::time::sleep(retry_after).await;
                        req = rejected.work;
                    }
                    other => return Err(other.into()),
                },
            }
        }
        pending.push((caller, rx));
    }

    for (caller, rx) in pending {
        match rx.await? {
            Ok(html) => println!("[{caller}] {html}"),
            Err(e) => println!("[{caller}] {} (retry in {:?})", e.as_label(), e.retry_hint()),
        }
    }
    println!("cache: {:?}", pipeline.cache().stats());

    // A long-running host would call `sup.run_until_signal(..)` instead.
    sup.shutdown(cfg.supervisor.drain_timeout).await?;
    pipeline.pool().shutdown(Duration::from_secs(1)).await;

    stop.cancel();
    let _ = listener.await;
    if let Ok(set) = Arc::try_unwrap(subs) {
        set.shutdown().await;
    }
    Ok(())
}
