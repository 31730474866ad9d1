mod common;

use async_trait::async_trait;
use common::{bucket_on, DownTokenStore, WINDOW};
use cornstand::rate_limit::{BucketState, TokenStore};
use cornstand::{
    Decision, DenyReason, InMemoryTokenStore, LimiterError, LocalDenyCache, ManualClock,
    MemorySink, Principal, RateLimiter, TokenBucket, TokenStoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn at_most_one_grant_inside_any_window() {
    for gap_secs in [0u64, 1, 30, 59] {
        let clock = ManualClock::at_epoch_2024();
        let bucket = bucket_on(&clock);
        let p = Principal::new("p");

        let first = bucket.check_and_consume(&p).await.unwrap();
        clock.advance(Duration::from_secs(gap_secs) + Duration::from_millis(999));
        let second = bucket.check_and_consume(&p).await.unwrap();
        assert!(first.is_allowed());
        assert!(!second.is_allowed(), "gap {}s granted twice", gap_secs);
    }
}

#[tokio::test]
async fn reset_at_is_exactly_when_the_next_grant_lands() {
    let clock = ManualClock::at_epoch_2024();
    let bucket = bucket_on(&clock);
    let p = Principal::new("p");

    let granted = bucket.check_and_consume(&p).await.unwrap();
    let reset_at = granted.reset_at();

    clock.set(reset_at - chrono::Duration::milliseconds(1));
    let early = bucket.check_and_consume(&p).await.unwrap();
    assert_eq!(early.reset_at(), reset_at);
    assert!(!early.is_allowed());

    clock.set(reset_at);
    assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());

    // Long idle periods do not bank extra tokens.
    clock.advance(Duration::from_secs(3600));
    assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());
    assert!(!bucket.check_and_consume(&p).await.unwrap().is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_checks_grant_exactly_once() {
    let bucket = Arc::new(bucket_on(&ManualClock::at_epoch_2024()));
    let p = Principal::new("contended");

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let bucket = bucket.clone();
            let p = p.clone();
            tokio::spawn(async move { bucket.check_and_consume(&p).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 1);
}

#[tokio::test]
async fn instances_sharing_a_store_share_the_bucket() {
    let clock = ManualClock::at_epoch_2024();
    let store = Arc::new(InMemoryTokenStore::with_clock(Arc::new(clock.clone())));
    let a = TokenBucket::new(store.clone(), WINDOW);
    let b = TokenBucket::new(store.clone(), WINDOW)
        .with_local_cache(Arc::new(LocalDenyCache::default()));
    let p = Principal::new("shared");

    assert!(a.check_and_consume(&p).await.unwrap().is_allowed());
    let denied = b.check_and_consume(&p).await.unwrap();
    assert!(matches!(denied, Decision::Denied { reason: DenyReason::Exhausted, .. }));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn instance_clock_skew_cannot_double_grant() {
    let store_clock = ManualClock::at_epoch_2024();
    let store = Arc::new(InMemoryTokenStore::with_clock(Arc::new(store_clock.clone())));

    // Two instances whose local clocks disagree by a full window.
    let behind = ManualClock::at_epoch_2024();
    let ahead = ManualClock::at_epoch_2024();
    ahead.advance(WINDOW);
    let a = TokenBucket::new(store.clone(), WINDOW)
        .with_clock(Arc::new(behind.clone()))
        .with_local_cache(Arc::new(LocalDenyCache::default()));
    let b = TokenBucket::new(store.clone(), WINDOW)
        .with_clock(Arc::new(ahead.clone()))
        .with_local_cache(Arc::new(LocalDenyCache::default()));
    let p = Principal::new("skewed");

    let granted = a.check_and_consume(&p).await.unwrap();
    assert!(granted.is_allowed());

    store_clock.advance(Duration::from_secs(1));
    let denied = b.check_and_consume(&p).await.unwrap();
    match denied {
        Decision::Denied { reason, wait, reset_at } => {
            assert_eq!(reason, DenyReason::Exhausted);
            assert_eq!(wait, Duration::from_secs(59));
            assert_eq!(reset_at, granted.reset_at());
        }
        other => panic!("skewed instance granted twice: {:?}", other),
    }

    // B's cache entry ages on B's own clock from the wait the store reported.
    ahead.advance(Duration::from_secs(58));
    let cached = b.check_and_consume(&p).await.unwrap();
    assert!(matches!(cached, Decision::Denied { reason: DenyReason::LocalCache, .. }));
    assert_eq!(cached.reset_at(), granted.reset_at());

    store_clock.advance(Duration::from_secs(59));
    ahead.advance(Duration::from_secs(1));
    assert!(b.check_and_consume(&p).await.unwrap().is_allowed());
}

#[tokio::test]
async fn local_cache_only_ever_denies() {
    let cache = Arc::new(LocalDenyCache::default());
    let sink = MemorySink::new();
    let clock = ManualClock::at_epoch_2024();
    let bucket = bucket_on(&clock).with_local_cache(cache.clone()).with_sink(sink.clone());
    let p = Principal::new("cached");

    assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());
    assert_eq!(cache.len(), 1);

    clock.advance(Duration::from_secs(10));
    let denied = bucket.check_and_consume(&p).await.unwrap();
    match denied {
        Decision::Denied { reason, wait, .. } => {
            assert_eq!(reason, DenyReason::LocalCache);
            assert_eq!(wait, Duration::from_secs(50));
        }
        other => panic!("cache must not grant: {:?}", other),
    }

    // Once the entry expires the authoritative store decides again.
    clock.advance(Duration::from_secs(50));
    assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());

    let kinds: Vec<_> = sink.events().iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec!["admission_granted", "admission_fast_path_rejected", "admission_granted"]
    );
}

#[tokio::test]
async fn store_outage_fails_closed() {
    let sink = MemorySink::new();
    let bucket = TokenBucket::new(DownTokenStore, WINDOW).with_sink(sink.clone());
    let err = bucket
        .check_and_consume(&Principal::new("p"))
        .await
        .unwrap_err();
    assert!(matches!(err, LimiterError::Store(TokenStoreError::Unavailable(_))));
    assert_eq!(sink.events()[0].kind(), "admission_store_unavailable");
}

/// Reads succeed but every write loses the race.
#[derive(Debug, Default)]
struct AlwaysLosingStore {
    writes: AtomicUsize,
}

#[async_trait]
impl TokenStore for AlwaysLosingStore {
    async fn now_ms(&self) -> Result<u64, TokenStoreError> {
        Ok(1_000)
    }

    async fn get_state(&self, _key: &str) -> Result<Option<(BucketState, u64)>, TokenStoreError> {
        Ok(Some((BucketState { tokens: 1, updated_at_ms: 0 }, 7)))
    }

    async fn set_state(
        &self,
        _key: &str,
        _state: BucketState,
        _expected_version: Option<u64>,
    ) -> Result<bool, TokenStoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

#[tokio::test]
async fn endless_contention_denies_with_short_backoff() {
    let store = Arc::new(AlwaysLosingStore::default());
    let sink = MemorySink::new();
    let bucket = TokenBucket::new(store.clone(), WINDOW).with_sink(sink.clone());

    let decision = bucket
        .check_and_consume(&Principal::new("p"))
        .await
        .unwrap();
    match decision {
        Decision::Denied { reason, wait, .. } => {
            assert_eq!(reason, DenyReason::Contention);
            assert_eq!(wait, Duration::from_secs(1));
        }
        other => panic!("contention must not grant: {:?}", other),
    }
    assert_eq!(store.writes.load(Ordering::SeqCst), 8);
    assert_eq!(sink.events().last().unwrap().kind(), "admission_contended");
}

#[tokio::test]
async fn larger_buckets_allow_bursts_up_to_capacity() {
    let clock = ManualClock::at_epoch_2024();
    let bucket = bucket_on(&clock).with_capacity(3);
    let p = Principal::new("burst");

    let mut remaining = Vec::new();
    for _ in 0..3 {
        remaining.push(bucket.check_and_consume(&p).await.unwrap().remaining());
    }
    assert_eq!(remaining, vec![2, 1, 0]);
    assert!(!bucket.check_and_consume(&p).await.unwrap().is_allowed());

    clock.advance(WINDOW);
    assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());
}
