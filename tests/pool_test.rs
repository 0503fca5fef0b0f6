mod common;

use common::FakeLauncher;
use fixture_sync::browser_pool::{BrowserProcess, EntryOrigin, PageResourcePool};
use std::sync::Arc;
use std::sync::atomic::Ordering;

async fn started_pool(capacity: usize) -> (Arc<PageResourcePool>, Arc<common::FakeWorld>) {
    let (launcher, world) = FakeLauncher::new();
    let process = Arc::new(BrowserProcess::new(launcher));
    process.launch().await.unwrap();
    let pool = PageResourcePool::new(process, capacity);
    assert_eq!(pool.initialize(capacity).await.unwrap(), capacity);
    (pool, world)
}

#[tokio::test]
async fn test_exhaustion_issues_ephemeral_page() {
    let (pool, world) = started_pool(2).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();

    assert_eq!(a.origin(), EntryOrigin::Permanent);
    assert_eq!(b.origin(), EntryOrigin::Permanent);
    assert_eq!(c.origin(), EntryOrigin::Ephemeral);

    let stats = pool.stats();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.leased_permanent, 2);
    assert_eq!(stats.leased_ephemeral, 1);
    assert_eq!(stats.ephemeral_issued, 1);

    a.release().await;
    b.release().await;
    c.release().await;

    let stats = pool.stats();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.permanent, 2);
    assert_eq!(stats.ephemeral_disposed, 1);
    assert_eq!(pool.outstanding_leases(), 0);
    // Only the ephemeral page was closed
    assert_eq!(world.pages_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_concurrent_exhaustion_never_blocks() {
    let (pool, world) = started_pool(2).await;

    let (a, b, c) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        tokio::join!(pool.acquire(), pool.acquire(), pool.acquire())
    })
    .await
    .expect("acquire blocked on an exhausted pool");
    let leases = [a.unwrap(), b.unwrap(), c.unwrap()];

    let ephemeral = leases
        .iter()
        .filter(|l| l.origin() == EntryOrigin::Ephemeral)
        .count();
    assert_eq!(ephemeral, 1);
    let stats = pool.stats();
    assert_eq!(stats.permanent, 2);
    assert_eq!(stats.leased_permanent, 2);

    for lease in leases {
        lease.release().await;
    }
    let stats = pool.stats();
    assert_eq!(stats.permanent, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.leased_ephemeral, 0);
    assert_eq!(pool.outstanding_leases(), 0);
    assert_eq!(world.pages_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_permanent_pages_never_exceed_capacity() {
    let (pool, _world) = started_pool(3).await;

    let mut leases = Vec::new();
    for _ in 0..8 {
        leases.push(pool.acquire().await.unwrap());
        let stats = pool.stats();
        assert!(stats.permanent <= stats.capacity);
        assert!(stats.available + stats.leased_permanent <= stats.capacity);
    }
    let permanent = leases
        .iter()
        .filter(|l| l.origin() == EntryOrigin::Permanent)
        .count();
    assert_eq!(permanent, 3);

    for lease in leases {
        lease.release().await;
    }
    let stats = pool.stats();
    assert_eq!(stats.available, 3);
    assert_eq!(stats.ephemeral_issued, 5);
    assert_eq!(stats.ephemeral_disposed, 5);
}

#[tokio::test]
async fn test_dead_page_is_replaced_on_acquire() {
    let (pool, world) = started_pool(1).await;

    let lease = pool.acquire().await.unwrap();
    let dead_id = lease.page().id().to_string();
    lease.release().await;

    world.current_browser().page(&dead_id).unwrap().kill();

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.page().id(), dead_id);
    assert_eq!(lease.origin(), EntryOrigin::Permanent);
    assert!(lease.page().is_alive().await);
    assert_eq!(pool.stats().dead_replaced, 1);
    lease.release().await;
    assert_eq!(pool.stats().available, 1);
}

#[tokio::test]
async fn test_rate_limited_lease_is_evicted_and_replenished() {
    let (pool, world) = started_pool(2).await;

    let mut lease = pool.acquire().await.unwrap();
    let evicted_id = lease.page().id().to_string();
    lease.mark_rate_limited();
    lease.release().await;

    let stats = pool.stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.permanent, 2);
    assert!(!pool.tracked_page_ids().contains(&evicted_id));
    assert!(!world.current_browser().page(&evicted_id).unwrap().is_alive_now());
}

#[tokio::test]
async fn test_stale_lease_is_discarded_after_invalidation() {
    let (pool, world) = started_pool(2).await;

    let lease = pool.acquire().await.unwrap();
    let old_generation = lease.generation();
    let new_generation = pool.invalidate_all().await;
    assert_eq!(new_generation, old_generation + 1);
    assert!(lease.is_stale());

    // Refill for the new generation while the old lease is still out
    assert_eq!(pool.initialize(2).await.unwrap(), 2);
    lease.release().await;

    let stats = pool.stats();
    assert_eq!(stats.stale_discarded, 1);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.generation, new_generation);
    // 1 pooled page closed by invalidation plus the stale lease
    assert_eq!(world.pages_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_lease_returns_to_pool() {
    let (pool, _world) = started_pool(1).await;

    {
        let _lease = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().available, 0);
    }
    // Drop spawns the return; yield until it has run
    for _ in 0..10 {
        if pool.stats().available == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.stats().available, 1);
    assert_eq!(pool.outstanding_leases(), 0);
}

#[tokio::test]
async fn test_initialize_fails_only_when_no_page_opens() {
    let (launcher, world) = FakeLauncher::new();
    let process = Arc::new(BrowserProcess::new(launcher));
    process.launch().await.unwrap();
    let pool = PageResourcePool::new(process, 2);

    world.set_fail_new_page(true);
    let err = pool.initialize(2).await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(pool.stats().permanent, 0);

    world.set_fail_new_page(false);
    assert_eq!(pool.initialize(2).await.unwrap(), 2);
}

#[tokio::test]
async fn test_acquire_without_browser_is_not_running() {
    let (launcher, _world) = FakeLauncher::new();
    let process = Arc::new(BrowserProcess::new(launcher));
    let pool = PageResourcePool::new(process, 1);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, fixture_sync::PoolError::NotRunning));
    // The reserved slot was given back
    assert_eq!(pool.stats().permanent, 0);
}
