use crate::adaptive::DynamicConfig;
use crate::clock::{from_millis, Clock, SystemClock};
use crate::error::{LimiterError, TokenStoreError};
use crate::identity::Principal;
use crate::rate_limit::cache::LocalDenyCache;
use crate::rate_limit::store::{BucketState, TokenStore};
use crate::rate_limit::{Decision, DenyReason, RateLimiter};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default admission window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default key prefix in the shared token store.
pub const DEFAULT_KEY_PREFIX: &str = "cornstand:purchase";
/// Optimistic write attempts before a check is denied for contention.
pub const MAX_CAS_ATTEMPTS: u32 = 8;
/// `reset_at` offset reported when a check is denied for contention.
const CONTENTION_BACKOFF: Duration = Duration::from_secs(1);

/// A per-principal token bucket with a rolling refill.
///
/// Holds at most `capacity` tokens per principal. A consumed token comes back exactly one
/// window after it was taken, so with capacity 1 the minimum gap between two grants is the
/// window itself, no matter where calendar boundaries fall.
///
/// All bucket arithmetic uses the store's clock ([`TokenStore::now_ms`]). The bucket's own
/// clock only ages entries in the local deny cache.
pub struct TokenBucket<S, K = NullSink> {
    store: Arc<S>,
    prefix: String,
    capacity: u32,
    window: DynamicConfig<Duration>,
    cache: Option<Arc<LocalDenyCache>>,
    clock: Arc<dyn Clock>,
    sink: K,
}

impl<S> TokenBucket<S, NullSink>
where
    S: TokenStore + 'static,
{
    /// Capacity-1 bucket refilled `window` after each consumption.
    pub fn new(store: S, window: Duration) -> Self {
        Self {
            store: Arc::new(store),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            capacity: 1,
            window: DynamicConfig::new(window),
            cache: None,
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<S, K> TokenBucket<S, K>
where
    S: TokenStore + 'static,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    /// Override the bucket capacity. Values below 1 are raised to 1.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Share a live window handle (e.g. one owned by the service config).
    pub fn with_window(mut self, window: DynamicConfig<Duration>) -> Self {
        self.window = window;
        self
    }

    /// Enable the in-process fast-path deny cache.
    pub fn with_local_cache(mut self, cache: Arc<LocalDenyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Local clock for the deny cache. Never used for grant decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Route admission events to `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> TokenBucket<S, K2>
    where
        K2: TelemetrySink,
    {
        TokenBucket {
            store: self.store,
            prefix: self.prefix,
            capacity: self.capacity,
            window: self.window,
            cache: self.cache,
            clock: self.clock,
            sink,
        }
    }

    /// Live handle to the refill window.
    pub fn window(&self) -> DynamicConfig<Duration> {
        self.window.clone()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn key(&self, principal: &Principal) -> String {
        format!("{}:{}", self.prefix, principal)
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.get().as_millis()).unwrap_or(u64::MAX).max(1)
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    fn denied(&self, now_ms: u64, reset_at_ms: u64, reason: DenyReason) -> Decision {
        Decision::Denied {
            reset_at: from_millis(reset_at_ms),
            wait: Duration::from_millis(reset_at_ms.saturating_sub(now_ms)),
            reason,
        }
    }

    async fn consume(&self, key: &str, principal: &Principal) -> Result<Decision, TokenStoreError> {
        let window_ms = self.window_ms();
        let mut now_ms = 0;

        for _ in 0..MAX_CAS_ATTEMPTS {
            now_ms = self.store.now_ms().await?;
            let (current, version) = match self.store.get_state(key).await? {
                Some((state, version)) => (state, Some(version)),
                None => (BucketState { tokens: self.capacity, updated_at_ms: now_ms }, None),
            };

            let refilled = refill(current, now_ms, self.capacity, window_ms);

            if refilled.tokens == 0 {
                let reset_at_ms = refilled.updated_at_ms.saturating_add(window_ms);
                self.remember(key, reset_at_ms, now_ms);
                let decision = self.denied(now_ms, reset_at_ms, DenyReason::Exhausted);
                self.emit(AdmissionEvent::Denied {
                    principal: principal.to_string(),
                    wait: Duration::from_millis(reset_at_ms.saturating_sub(now_ms)),
                })
                .await;
                return Ok(decision);
            }

            let consumed = take_token(refilled, now_ms, self.capacity);
            if self.store.set_state(key, consumed, version).await? {
                let reset_at_ms = consumed.updated_at_ms.saturating_add(window_ms);
                if consumed.tokens == 0 {
                    self.remember(key, reset_at_ms, now_ms);
                }
                self.emit(AdmissionEvent::Granted {
                    principal: principal.to_string(),
                    remaining: consumed.tokens,
                })
                .await;
                return Ok(Decision::Allowed {
                    remaining: consumed.tokens,
                    reset_at: from_millis(reset_at_ms),
                });
            }
            tracing::trace!(target: "cornstand::limiter", %principal, "bucket write lost a race; retrying");
        }

        tracing::warn!(
            target: "cornstand::limiter",
            %principal,
            attempts = MAX_CAS_ATTEMPTS,
            "bucket contention exhausted retries; denying"
        );
        self.emit(AdmissionEvent::Contended {
            principal: principal.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
        .await;
        let backoff_ms = u64::try_from(CONTENTION_BACKOFF.as_millis()).unwrap_or(1_000);
        Ok(self.denied(now_ms, now_ms.saturating_add(backoff_ms), DenyReason::Contention))
    }

    fn remember(&self, key: &str, reset_at_ms: u64, now_ms: u64) {
        if let Some(cache) = &self.cache {
            let wait = Duration::from_millis(reset_at_ms.saturating_sub(now_ms));
            cache.remember(key, reset_at_ms, wait, self.clock.now_millis());
        }
    }
}

/// Bring `state` up to `now_ms`: one token per elapsed window, capped at `capacity`.
fn refill(state: BucketState, now_ms: u64, capacity: u32, window_ms: u64) -> BucketState {
    if state.tokens >= capacity {
        return BucketState { tokens: capacity, updated_at_ms: now_ms };
    }
    let elapsed = now_ms.saturating_sub(state.updated_at_ms);
    let gained = elapsed / window_ms;
    let tokens = u64::from(state.tokens).saturating_add(gained).min(u64::from(capacity));
    let tokens = u32::try_from(tokens).unwrap_or(capacity);
    if tokens >= capacity {
        BucketState { tokens: capacity, updated_at_ms: now_ms }
    } else {
        BucketState {
            tokens,
            updated_at_ms: state.updated_at_ms.saturating_add(gained.saturating_mul(window_ms)),
        }
    }
}

/// Consume one token from a refilled, non-empty bucket.
///
/// Taking from a full bucket starts the refill clock now; taking from a partially full
/// bucket leaves the pending refill where it was.
fn take_token(state: BucketState, now_ms: u64, capacity: u32) -> BucketState {
    let updated_at_ms = if state.tokens >= capacity { now_ms } else { state.updated_at_ms };
    BucketState { tokens: state.tokens - 1, updated_at_ms }
}

#[async_trait]
impl<S, K> RateLimiter for TokenBucket<S, K>
where
    S: TokenStore + 'static,
    K: TelemetrySink + Sync,
    K::Future: Send + 'static,
{
    async fn check_and_consume(&self, principal: &Principal) -> Result<Decision, LimiterError> {
        let key = self.key(principal);

        let cached = self.cache.as_ref().and_then(|c| c.check(&key, self.clock.now_millis()));
        if let Some((reset_at_ms, wait)) = cached {
            self.emit(AdmissionEvent::FastPathRejected { principal: principal.to_string(), wait })
                .await;
            return Ok(Decision::Denied {
                reset_at: from_millis(reset_at_ms),
                wait,
                reason: DenyReason::LocalCache,
            });
        }

        match self.consume(&key, principal).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::error!(
                    target: "cornstand::limiter",
                    %principal,
                    error = %e,
                    "token store failed; failing closed"
                );
                self.emit(AdmissionEvent::StoreUnavailable {
                    principal: principal.to_string(),
                    error: e.to_string(),
                })
                .await;
                Err(LimiterError::Store(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryTokenStore;
    use crate::telemetry::MemorySink;

    fn principal(id: &str) -> Principal {
        Principal::new(id)
    }

    fn bucket_on(clock: &ManualClock) -> TokenBucket<InMemoryTokenStore> {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        TokenBucket::new(InMemoryTokenStore::with_clock(shared.clone()), DEFAULT_WINDOW)
            .with_clock(shared)
    }

    #[test]
    fn refill_is_exact_at_window_boundary() {
        let spent = BucketState { tokens: 0, updated_at_ms: 1_000 };
        assert_eq!(refill(spent, 60_999, 1, 60_000).tokens, 0);
        assert_eq!(refill(spent, 61_000, 1, 60_000).tokens, 1);
    }

    #[test]
    fn partial_refill_keeps_accrual_phase() {
        let state = BucketState { tokens: 0, updated_at_ms: 0 };
        let r = refill(state, 25, 3, 10);
        assert_eq!(r, BucketState { tokens: 2, updated_at_ms: 20 });
    }

    #[tokio::test]
    async fn second_check_inside_window_is_denied() {
        let clock = ManualClock::at_epoch_2024();
        let bucket = bucket_on(&clock);
        let p = principal("u-1");

        let first = bucket.check_and_consume(&p).await.unwrap();
        assert!(first.is_allowed());
        assert_eq!(first.remaining(), 0);
        assert_eq!(first.reset_at(), clock.now() + chrono::Duration::seconds(60));

        clock.advance(Duration::from_secs(59));
        let second = bucket.check_and_consume(&p).await.unwrap();
        match second {
            Decision::Denied { wait, reason, .. } => {
                assert_eq!(wait, Duration::from_secs(1));
                assert_eq!(reason, DenyReason::Exhausted);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cache_rejects_without_store_and_emits() {
        let clock = ManualClock::at_epoch_2024();
        let sink = MemorySink::new();
        let bucket = bucket_on(&clock)
            .with_local_cache(Arc::new(LocalDenyCache::default()))
            .with_sink(sink.clone());
        let p = principal("u-2");

        assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());
        let denied = bucket.check_and_consume(&p).await.unwrap();
        assert!(matches!(denied, Decision::Denied { reason: DenyReason::LocalCache, .. }));
        assert_eq!(denied.reset_at(), clock.now() + chrono::Duration::seconds(60));

        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["admission_granted", "admission_fast_path_rejected"]);
    }

    #[tokio::test]
    async fn shrinking_window_applies_to_next_check() {
        let clock = ManualClock::at_epoch_2024();
        let bucket = bucket_on(&clock);
        let p = principal("u-3");
        assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());

        bucket.window().set(Duration::from_secs(10));
        clock.advance(Duration::from_secs(10));
        assert!(bucket.check_and_consume(&p).await.unwrap().is_allowed());
    }
}
