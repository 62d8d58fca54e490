//! End-to-end behaviour of the serving core through its public API.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use servevisor::{
    BackoffPolicy, Bus, BucketConfig, Cache, CacheConfig, CacheError, EventKind, ExecError,
    ExecFn, ExitReason, PoolConfig, PoolError, ProcessContext, ProcessFn, ProcessState,
    RateLimiter, RateLimiterConfig, RestartCeiling, Supervisor, SupervisorConfig,
    SupervisorError, WorkerPool,
};

fn limiter(capacity: u32, rate: f64) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig {
        default: BucketConfig::new(capacity, rate),
        ..RateLimiterConfig::default()
    })
}

fn sleeping_pool(
    slots: usize,
    depth: usize,
) -> WorkerPool<impl servevisor::Executor<Payload = u64, Output = u64>> {
    let exec = ExecFn::new(|ms: u64, ctx: CancellationToken| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok::<_, ExecError>(ms),
            _ = ctx.cancelled() => Err(ExecError::Canceled),
        }
    });
    WorkerPool::new(
        PoolConfig {
            slots,
            max_queue_depth: depth,
            ..PoolConfig::default()
        },
        exec,
        Bus::new(64),
    )
}

#[tokio::test(start_paused = true)]
async fn burst_beyond_capacity_is_denied_until_refill() {
    let rl = limiter(2, 1.0);
    let now = Instant::now();

    let decisions: Vec<_> = (0..3).map(|_| rl.allow("x")).collect();
    let admitted: Vec<bool> = decisions.iter().map(|d| d.admitted).collect();
    assert_eq!(admitted, vec![true, true, false]);

    let third = decisions[2];
    assert_eq!(third.remaining, 0);
    let wait = third.reset_at - now;
    assert!(
        wait >= Duration::from_millis(990) && wait <= Duration::from_millis(1010),
        "reset in {wait:?}"
    );

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(rl.allow("x").admitted);
    assert!(!rl.allow("x").admitted);
}

#[tokio::test(start_paused = true)]
async fn admitted_requests_never_exceed_issued_tokens() {
    let capacity = 5;
    let rate = 2.0;
    let rl = limiter(capacity, rate);
    let start = Instant::now();
    let mut rng = rand::rng();
    let mut admitted = 0u64;

    for _ in 0..500 {
        if rng.random_bool(0.3) {
            tokio::time::advance(Duration::from_millis(rng.random_range(0..400))).await;
        }
        let d = rl.allow("k");
        assert!(d.remaining <= capacity);
        if d.admitted {
            admitted += 1;
        }
        let issued = f64::from(capacity) + start.elapsed().as_secs_f64() * rate;
        assert!(admitted as f64 <= issued + 1e-9, "{admitted} > {issued}");
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_run_one_loader() {
    let cache: Cache<&'static str, String> = Cache::new(CacheConfig {
        default_ttl: Duration::from_secs(5),
        ..CacheConfig::default()
    });
    let runs = Arc::new(AtomicUsize::new(0));

    let reads = (0..10).map(|_| {
        let cache = cache.clone();
        let runs = Arc::clone(&runs);
        async move {
            cache
                .get_or_load("k", None, move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, io::Error>("v".to_string())
                    }
                })
                .await
        }
    });
    let values = join_all(reads).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| matches!(v.as_deref(), Ok("v"))));
    assert_eq!(cache.get(&"k").as_deref(), Some("v"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_share_one_failure() {
    let cache: Cache<u32, u32> = Cache::new(CacheConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let reads = (0..100).map(|_| {
        let cache = cache.clone();
        let runs = Arc::clone(&runs);
        async move {
            cache
                .get_or_load(7, None, move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u32, _>(io::Error::other("backend down"))
                    }
                })
                .await
        }
    });
    let results = join_all(reads).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    for res in &results {
        match res {
            Err(err @ CacheError::LoadFailed { .. }) => {
                let cause = err.cause_as::<io::Error>().map(|e| e.to_string());
                assert_eq!(cause.as_deref(), Some("backend down"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    // Failures are not memoized.
    assert!(cache.get(&7).is_none());
    let value = cache
        .get_or_load(7, None, || async { Ok::<_, io::Error>(1) })
        .await;
    assert!(matches!(value, Ok(1)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_at_deadline_not_at_completion() {
    let pool = sleeping_pool(2, 8);
    let started = Instant::now();

    let handle = pool
        .submit(500, Some(Duration::from_millis(100)))
        .expect("queue has room");
    let err = handle.wait().await.unwrap_err();

    let took = started.elapsed();
    assert_eq!(err, PoolError::DeadlineExceeded);
    assert!(took >= Duration::from_millis(100), "{took:?}");
    assert!(took < Duration::from_millis(500), "{took:?}");
    assert_eq!(pool.stats().expired, 1);

    assert_eq!(pool.shutdown(Duration::from_secs(1)).await, 0);
}

#[tokio::test(start_paused = true)]
async fn submit_beyond_depth_fails_fast() {
    let pool = sleeping_pool(1, 2);

    let a = pool.submit(1_000, None).expect("room");
    let b = pool.submit(1_000, None).expect("room");
    let full = pool.submit(1_000, None).unwrap_err();
    assert!(matches!(full, PoolError::QueueFull { depth: 2, .. }));
    assert!(full.retry_hint().is_some());

    // Repeated cancels of a terminal task are no-ops.
    assert!(a.cancel());
    assert!(!a.cancel());
    assert!(!pool.cancel(a.id()));
    assert_eq!(a.wait().await, Err(PoolError::Cancelled));

    assert!(b.cancel());
    assert_eq!(pool.shutdown(Duration::from_secs(1)).await, 0);
}

#[tokio::test(start_paused = true)]
async fn invalidate_absent_key_is_a_noop() {
    let cache: Cache<&'static str, u8> = Cache::new(CacheConfig::default());
    assert!(!cache.invalidate(&"missing"));
    assert!(!cache.invalidate(&"missing"));
    assert!(cache.is_empty());

    cache.insert("present", 1, None);
    assert!(cache.invalidate(&"present"));
    assert!(!cache.invalidate(&"present"));
}

fn supervisor_cfg() -> SupervisorConfig {
    SupervisorConfig {
        backoff: BackoffPolicy::constant(Duration::from_millis(200)),
        ceiling: RestartCeiling {
            max_restarts: 2,
            window: Duration::from_secs(30),
        },
        inbox_capacity: 4,
        ..SupervisorConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn killed_worker_is_replaced_while_dispatch_keeps_flowing() {
    let bus = Bus::new(256);
    let mut events = bus.subscribe();
    let handled = Arc::new(AtomicUsize::new(0));
    let process = {
        let handled = Arc::clone(&handled);
        ProcessFn::arc(move |ctx: ProcessContext<u32>| {
            let handled = Arc::clone(&handled);
            async move {
                ctx.ready();
                while ctx.recv().await.is_some() {
                    handled.fetch_add(1, Ordering::SeqCst);
                    ctx.heartbeat();
                }
                Ok(())
            }
        })
    };
    let sup = Supervisor::new(supervisor_cfg(), process, bus);
    sup.start(3, 3, Duration::from_secs(1)).await.unwrap();

    let victim = sup.snapshot()[1].id;
    sup.on_exit(victim, ExitReason::Killed("test".into()));
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sup.snapshot()[1].state, ProcessState::Dead);

    let mut accepted = 0;
    for n in 0..20 {
        match sup.dispatch(n) {
            Ok(id) => {
                assert_ne!(id, victim);
                accepted += 1;
            }
            Err(rejected) => {
                assert!(matches!(rejected.error, SupervisorError::NoCapacity { .. }));
                assert_eq!(rejected.work, n);
            }
        }
        tokio::task::yield_now().await;
    }
    assert!(accepted > 0);

    assert!(sup.wait_for_ready(3, Duration::from_secs(1)).await);
    let replaced = &sup.snapshot()[1];
    assert_eq!(replaced.id.slot, victim.slot);
    assert_eq!(replaced.id.generation, victim.generation + 1);
    assert_eq!(replaced.state, ProcessState::Ready);

    let mut spawned = 0;
    while let Ok(ev) = events.try_recv() {
        if ev.kind == EventKind::WorkerSpawned {
            spawned += 1;
        }
    }
    assert_eq!(spawned, 4);

    sup.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), accepted);
}

#[tokio::test(start_paused = true)]
async fn crash_loop_is_quarantined_until_reset() {
    let bus = Bus::new(256);
    let mut events = bus.subscribe();
    let lives = Arc::new(AtomicUsize::new(0));
    let process = {
        let lives = Arc::clone(&lives);
        ProcessFn::arc(move |ctx: ProcessContext<u32>| {
            let life = lives.fetch_add(1, Ordering::SeqCst);
            async move {
                ctx.ready();
                // Slot 0 crashes until an operator resets it.
                if ctx.id().slot == 0 && life < 8 {
                    return Err(ExecError::fail("corrupt state"));
                }
                while ctx.recv().await.is_some() {}
                Ok(())
            }
        })
    };
    let sup = Supervisor::new(supervisor_cfg(), process, bus);
    let _ = sup.start(2, 1, Duration::from_secs(1)).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let slots = sup.snapshot();
    assert_eq!(slots[0].state, ProcessState::Quarantined);
    assert_eq!(slots[1].state, ProcessState::Ready);
    assert_eq!(sup.ready_count(), 1);

    // Healthy slot still takes work.
    assert_eq!(sup.dispatch(1).unwrap().slot, 1);

    let mut degraded = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.kind == EventKind::PoolDegraded {
            degraded.push(ev.slot);
        }
    }
    assert_eq!(degraded, vec![Some(0)]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(sup.snapshot()[0].state, ProcessState::Quarantined);

    lives.store(100, Ordering::SeqCst);
    sup.reset(0).await.unwrap();
    assert!(sup.wait_for_ready(2, Duration::from_secs(1)).await);
    assert_eq!(sup.snapshot()[0].restarts, 0);
    assert_eq!(
        sup.reset(0).await,
        Err(SupervisorError::NotQuarantined { slot: 0 })
    );

    sup.shutdown(Duration::from_secs(1)).await.unwrap();
}
