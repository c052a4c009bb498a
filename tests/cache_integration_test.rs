//! End-to-end tests for the weak-reference cache with a live janitor.

use std::sync::Arc;
use std::time::Duration;

use plinth::cache::WeakCache;
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ttl_hold_bridges_the_gap_until_the_janitor_expires_it() {
    let p = pool("janitor");
    let ctx = Ctx::background();
    let cache: WeakCache<String, Vec<u8>> = WeakCache::builder()
        .ttl(Duration::from_millis(100))
        .interval(Duration::from_secs(1))
        .build(&ctx, &p)
        .await
        .unwrap();

    {
        let value = Arc::new(vec![1u8, 2, 3]);
        cache
            .set(&ctx, "blob".to_string(), value)
            .await
            .unwrap();
        // the caller's only strong reference dies with this scope
    }

    // immediately: the TTL hold keeps the entry alive
    let held = cache.get(&ctx, &"blob".to_string()).await.unwrap();
    assert_eq!(held.as_deref(), Some(&vec![1u8, 2, 3]));
    drop(held);

    // after the hold expires and a janitor tick runs, the entry is gone
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.get(&ctx, &"blob".to_string()).await.unwrap(), None);
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn externally_held_values_survive_the_janitor_without_ttl_holds() {
    let p = pool("held");
    let ctx = Ctx::background();
    let cache: WeakCache<u32, String> = WeakCache::builder()
        .ttl(Duration::from_millis(50))
        .interval(Duration::from_secs(1))
        .build(&ctx, &p)
        .await
        .unwrap();

    let pinned = Arc::new("pinned".to_string());
    cache.set(&ctx, 7, pinned.clone()).await.unwrap();

    // long after the hold expired, the external strong reference keeps the
    // entry observable
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let got = cache.get(&ctx, &7).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&got, &pinned));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filler_and_dedup_compose_under_concurrency() {
    let p = pool("compose");
    let ctx = Ctx::background();
    let cache: WeakCache<String, String> = WeakCache::builder()
        .ttl(Duration::from_secs(60))
        .interval(Duration::from_secs(1))
        .single_flight()
        .dedup_by(|v: &String| v.clone())
        .filler(|_ctx, key: String| async move {
            // every key resolves to the same payload, exercising dedup
            let _ = key;
            Ok(Some(Arc::new("shared-payload".to_string())))
        })
        .build(&ctx, &p)
        .await
        .unwrap();

    let mut lookups = Vec::new();
    for i in 0..16 {
        let cache = cache.clone();
        let ctx = ctx.clone();
        lookups.push(tokio::spawn(async move {
            cache
                .get(&ctx, &format!("key-{}", i % 4))
                .await
                .unwrap()
                .unwrap()
        }));
    }

    let mut values = Vec::new();
    for lookup in lookups {
        values.push(lookup.await.unwrap());
    }

    // deduplication folded every key's payload into one shared allocation
    for value in &values {
        assert_eq!(**value, "shared-payload");
        assert!(Arc::ptr_eq(value, &values[0]));
    }

    cache.close();
}
