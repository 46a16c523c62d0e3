//! Integration tests for kairos-ratelimit

use kairos_ratelimit::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_shared_store_limits_all_limiters() {
    let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
    let a = DispatchLimiter::new(store.clone(), "pool", 3, Duration::from_secs(1)).unwrap();
    let b = DispatchLimiter::new(store, "pool", 3, Duration::from_secs(1)).unwrap();

    a.acquire().await.unwrap();
    b.acquire().await.unwrap();
    a.acquire().await.unwrap();

    assert!(matches!(
        b.try_acquire().await.unwrap(),
        Decision::Deferred { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_waits_for_window() {
    let limiter = DispatchLimiter::in_memory("pool", 2, Duration::from_millis(500)).unwrap();
    let start = tokio::time::Instant::now();

    for _ in 0..5 {
        limiter.acquire().await.unwrap();
    }

    // starts 3-4 wait one window, start 5 a second one
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[test]
fn test_limiter_accessors() {
    let limiter = DispatchLimiter::in_memory("pool", 7, Duration::from_secs(2)).unwrap();
    assert_eq!(limiter.max(), 7);
    assert_eq!(limiter.window(), Duration::from_secs(2));
}
