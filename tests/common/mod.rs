#![allow(dead_code)]

use async_trait::async_trait;
use cornstand::audit::{
    AttemptPatch, AttemptQuery, AttemptRecord, AttemptType, AuditStore, NewAttempt, NewPurchase,
    Purchase,
};
use cornstand::rate_limit::{BucketState, TokenStore};
use cornstand::{
    Clock, HistoryService, IdentityError, IdentityService, InMemoryAuditStore, InMemoryTokenStore,
    ManualClock, MemorySink, Principal, PurchaseWorkflow, RateLimiter, StaticTokenIdentity,
    StoreError, TokenBucket, TokenStoreError,
};
use http::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const ALICE: &str = "alice-token";
pub const BOB: &str = "bob-token";
pub const WINDOW: Duration = Duration::from_secs(60);

pub fn identity() -> Arc<StaticTokenIdentity> {
    Arc::new(StaticTokenIdentity::new().with_token(ALICE, "user-alice").with_token(BOB, "user-bob"))
}

pub fn auth(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    headers
}

/// Everything a purchase test needs, sharing one manual clock.
pub struct Harness {
    pub clock: ManualClock,
    pub store: FlakyAuditStore,
    pub sink: MemorySink,
    pub workflow: PurchaseWorkflow,
    pub history: HistoryService,
}

/// A capacity-1 bucket whose store and cache both run on `clock`.
pub fn bucket_on(clock: &ManualClock) -> TokenBucket<InMemoryTokenStore> {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    TokenBucket::new(InMemoryTokenStore::with_clock(shared.clone()), WINDOW).with_clock(shared)
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::at_epoch_2024();
        let limiter = bucket_on(&clock);
        let sink = MemorySink::new();
        Self::with_limiter(clock, Arc::new(limiter.with_sink(sink.clone())), sink)
    }

    pub fn with_limiter(clock: ManualClock, limiter: Arc<dyn RateLimiter>, sink: MemorySink) -> Self {
        Self::with_parts(clock, identity(), limiter, sink)
    }

    pub fn with_parts(
        clock: ManualClock,
        identity: Arc<dyn IdentityService>,
        limiter: Arc<dyn RateLimiter>,
        sink: MemorySink,
    ) -> Self {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = FlakyAuditStore::new(InMemoryAuditStore::with_clock(shared.clone()));
        let workflow = PurchaseWorkflow::new(identity.clone(), limiter, Arc::new(store.clone()));
        let history = HistoryService::new(identity, Arc::new(store.clone()));
        Self { clock, store, sink, workflow, history }
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.store.inner.attempts()
    }
}

/// Wraps the in-memory store with switchable failures per operation.
#[derive(Clone, Debug)]
pub struct FlakyAuditStore {
    pub inner: InMemoryAuditStore,
    pub fail_attempts: Arc<AtomicBool>,
    pub fail_purchases: Arc<AtomicBool>,
    pub fail_queries: Arc<AtomicBool>,
    pub fail_summary: Arc<AtomicBool>,
}

impl FlakyAuditStore {
    pub fn new(inner: InMemoryAuditStore) -> Self {
        Self {
            inner,
            fail_attempts: Arc::default(),
            fail_purchases: Arc::default(),
            fail_queries: Arc::default(),
            fail_summary: Arc::default(),
        }
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditStore for FlakyAuditStore {
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<AttemptRecord, StoreError> {
        Self::check(&self.fail_attempts)?;
        self.inner.insert_attempt(attempt).await
    }

    async fn update_attempt(&self, id: Uuid, patch: AttemptPatch) -> Result<(), StoreError> {
        Self::check(&self.fail_attempts)?;
        self.inner.update_attempt(id, patch).await
    }

    async fn query_attempts(&self, query: &AttemptQuery) -> Result<Vec<AttemptRecord>, StoreError> {
        Self::check(&self.fail_queries)?;
        self.inner.query_attempts(query).await
    }

    async fn attempt_types(&self, user_id: &str) -> Result<Vec<AttemptType>, StoreError> {
        Self::check(&self.fail_summary)?;
        self.inner.attempt_types(user_id).await
    }

    async fn insert_purchase(&self, purchase: NewPurchase) -> Result<Purchase, StoreError> {
        Self::check(&self.fail_purchases)?;
        self.inner.insert_purchase(purchase).await
    }

    async fn get_purchase(&self, id: Uuid) -> Result<Option<Purchase>, StoreError> {
        self.inner.get_purchase(id).await
    }
}

/// A token store that is always down.
#[derive(Debug, Default)]
pub struct DownTokenStore;

#[async_trait]
impl TokenStore for DownTokenStore {
    async fn now_ms(&self) -> Result<u64, TokenStoreError> {
        Err(TokenStoreError::Unavailable("connection refused".into()))
    }

    async fn get_state(&self, _key: &str) -> Result<Option<(BucketState, u64)>, TokenStoreError> {
        Err(TokenStoreError::Unavailable("connection refused".into()))
    }

    async fn set_state(
        &self,
        _key: &str,
        _state: BucketState,
        _expected_version: Option<u64>,
    ) -> Result<bool, TokenStoreError> {
        Err(TokenStoreError::Unavailable("connection refused".into()))
    }
}

/// Identity provider that panics while resolving.
#[derive(Debug, Default)]
pub struct PanickingIdentity;

#[async_trait]
impl IdentityService for PanickingIdentity {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn current_principal(&self, _headers: &HeaderMap) -> Result<Principal, IdentityError> {
        panic!("identity backend exploded")
    }
}

/// Identity provider that cannot be reached.
#[derive(Debug, Default)]
pub struct UnavailableIdentity;

#[async_trait]
impl IdentityService for UnavailableIdentity {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn current_principal(&self, _headers: &HeaderMap) -> Result<Principal, IdentityError> {
        Err(IdentityError::Unavailable("auth service timed out".into()))
    }
}
