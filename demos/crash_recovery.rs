//! # Example: crash_recovery
//!
//! Demonstrates respawn with backoff, quarantine and operator reset.
//!
//! Shows how to:
//! - Write a worker process with [`ProcessFn`].
//! - Observe lifecycle events with a closure [`SubscribeFn`].
//! - Read slot state through [`Supervisor::snapshot`].
//! - Bring a quarantined slot back with [`Supervisor::reset`].
//!
//! ## Flow
//! ```text
//! slot 0: ready ─► panics on "poison" ─► Dead ─► backoff ─► respawn
//!                                      └─ 3rd death within 10s ─► Quarantined ─► reset ─► Starting
//! slot 1: keeps serving the whole time
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example crash_recovery
//! ```

use std::sync::Arc;
use std::time::Duration;

use servevisor::{
    BackoffPolicy, Bus, Event, EventKind, JitterPolicy, ProcessContext, ProcessFn, ProcessState,
    RestartCeiling, Subscribe, SubscribeFn, SubscriberSet, Supervisor, SupervisorConfig,
};
use tokio_util::sync::CancellationToken;

fn print_event(ev: &Event) {
    let worker = ev.worker.as_deref().unwrap_or("-");
    match ev.kind {
        EventKind::WorkerSpawned => println!("[sub] spawned   {worker}"),
        EventKind::WorkerReady => println!("[sub] ready     {worker}"),
        EventKind::WorkerDied => println!(
            "[sub] died      {worker} reason={}",
            ev.reason.as_deref().unwrap_or("-")
        ),
        EventKind::RespawnScheduled => {
            println!("[sub] respawn   {worker} in {}ms", ev.delay_ms.unwrap_or(0))
        }
        EventKind::PoolDegraded => println!(
            "[sub] DEGRADED  slot={} {}",
            ev.slot.unwrap_or(0),
            ev.reason.as_deref().unwrap_or("-")
        ),
        EventKind::WorkOrphaned => println!("[sub] orphaned  {worker}"),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = SupervisorConfig {
        pool_size: 2,
        min_ready: 2,
        backoff: BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        },
        ceiling: RestartCeiling {
            max_restarts: 2,
            window: Duration::from_secs(10),
        },
        ..SupervisorConfig::default()
    };

    let bus = Bus::new(256);
    let stop = CancellationToken::new();
    let subs: Vec<Arc<dyn Subscribe>> = vec![SubscribeFn::arc("console", print_event)];
    let subs = Arc::new(SubscriberSet::new(subs, bus.clone()));
    let listener = subs.spawn_listener(&bus, stop.clone());

    let worker = ProcessFn::arc(|ctx: ProcessContext<&'static str>| async move {
        ctx.ready();
        while let Some(job) = ctx.recv().await {
            if job == "poison" {
                panic!("poisoned by {job:?}");
            }
            println!("[{}] handled {job}", ctx.id());
        }
        Ok(())
    });
    let sup = Supervisor::new(cfg, worker, bus);
    sup.launch().await?;

    // Each poison pill kills whichever process receives it.
    for _ in 0..3 {
        sup.wait_for_ready(2, Duration::from_secs(5)).await;
        let _ = sup.dispatch("poison");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = sup.dispatch("hello");
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    for info in sup.snapshot() {
        println!("{} state={:?} restarts={}", info.id, info.state, info.restarts);
        if info.state == ProcessState::Quarantined {
            let id = sup.reset(info.id.slot).await?;
            println!("reset slot {} -> {id}", info.id.slot);
        }
    }
    sup.wait_for_ready(2, Duration::from_secs(5)).await;
    let _ = sup.dispatch("after reset");
    tokio::time::sleep(Duration::from_millis(100)).await;

    sup.shutdown(Duration::from_secs(2)).await?;
    stop.cancel();
    let _ = listener.await;
    if let Ok(set) = Arc::try_unwrap(subs) {
        set.shutdown().await;
    }
    Ok(())
}
