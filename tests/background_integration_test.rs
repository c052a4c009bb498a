//! End-to-end tests for the background task supervisor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plinth::backoff::{Backoff, Policy};
use plinth::background::Supervisor;
use plinth::pool::{PoolConfig, WorkerPool};
use plinth::Ctx;

fn pool(name: &str) -> WorkerPool {
    WorkerPool::new(
        &Ctx::background(),
        PoolConfig {
            name: name.to_string(),
            static_size: 2,
            idle_timeout: Duration::from_millis(100),
            disable_limited_wait_warn: false,
        },
    )
    .unwrap()
}

fn tight_backoff() -> Backoff {
    Backoff::new(Policy {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(20),
        multiplier: 2.0,
        randomization_factor: 0.0,
    })
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_task_restarts_then_stops_on_cancel() {
    let supervisor = Supervisor::new(&Ctx::background(), pool("counter"));
    let (ctx, canceller) = Ctx::background().with_cancel();
    let counter = Arc::new(AtomicUsize::new(0));

    let ticks = counter.clone();
    supervisor
        .run(
            &ctx,
            "counter",
            move |_c| {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            },
            tight_backoff(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        counter.load(Ordering::SeqCst) >= 2,
        "task should have restarted at least once"
    );

    canceller.cancel();
    // let any in-flight iteration drain, then the counter must hold still
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), settled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn supervisor_close_stops_everything_and_rejects_new_work() {
    let supervisor = Supervisor::new(&Ctx::background(), pool("shutdown"));
    let iterations = Arc::new(AtomicUsize::new(0));

    for name in ["a", "b", "c"] {
        let iterations = iterations.clone();
        supervisor
            .run(
                &Ctx::background(),
                name,
                move |c| {
                    let iterations = iterations.clone();
                    async move {
                        iterations.fetch_add(1, Ordering::SeqCst);
                        c.cancelled().await;
                        Ok(())
                    }
                },
                tight_backoff(),
            )
            .await
            .unwrap();
    }
    assert_eq!(supervisor.task_count(), 3);

    supervisor.close(&Ctx::background()).await.unwrap();
    assert_eq!(supervisor.task_count(), 0);
    assert!(supervisor.run(
        &Ctx::background(),
        "late",
        |_c| async { Ok(()) },
        tight_backoff(),
    )
    .await
    .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn once_tasks_execute_and_count_errors_independently() {
    let supervisor = Supervisor::new(&Ctx::background(), pool("once"));
    let succeeded = Arc::new(AtomicUsize::new(0));

    for i in 0..4usize {
        let succeeded = succeeded.clone();
        supervisor
            .once(&Ctx::background(), "ingest", move |_c| async move {
                if i % 2 == 0 {
                    succeeded.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("ingest {} failed", i))
                }
            })
            .await
            .unwrap();
    }

    supervisor.pool().wait().await;
    assert_eq!(succeeded.load(Ordering::SeqCst), 2);
}
