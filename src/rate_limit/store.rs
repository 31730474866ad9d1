use crate::clock::{Clock, SystemClock};
use crate::error::TokenStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Token bucket state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whole tokens available.
    pub tokens: u32,
    /// Epoch millis from which the next token accrues. Only meaningful while the bucket is
    /// below capacity.
    pub updated_at_ms: u64,
}

/// Abstract storage interface for limiter state.
///
/// Each key carries an opaque version that changes on every successful write. Writers pass
/// the version they read; the store rejects the write if the key has moved on. This is the
/// only way bucket state may be mutated.
///
/// The store is also the time authority. Every instance sharing a store computes refills
/// against [`TokenStore::now_ms`], never against its own clock, so skew between instances
/// cannot turn one spent bucket into two grants.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Current time on the store's clock, in epoch millis.
    async fn now_ms(&self) -> Result<u64, TokenStoreError>;

    /// Fetch the current state and version for a key.
    async fn get_state(&self, key: &str) -> Result<Option<(BucketState, u64)>, TokenStoreError>;

    /// Compare-and-set write.
    ///
    /// * `expected_version`: the version returned by [`TokenStore::get_state`], or `None` if
    ///   the key was absent (the write then only succeeds if the key is still absent).
    ///
    /// Returns `Ok(true)` if the write landed, `Ok(false)` if a concurrent writer won.
    async fn set_state(
        &self,
        key: &str,
        state: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, TokenStoreError>;
}

#[async_trait]
impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    async fn now_ms(&self) -> Result<u64, TokenStoreError> {
        (**self).now_ms().await
    }

    async fn get_state(&self, key: &str) -> Result<Option<(BucketState, u64)>, TokenStoreError> {
        (**self).get_state(key).await
    }

    async fn set_state(
        &self,
        key: &str,
        state: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, TokenStoreError> {
        (**self).set_state(key, state, expected_version).await
    }
}

/// In-process token store. Suitable for a single instance and for tests.
#[derive(Clone, Debug)]
pub struct InMemoryTokenStore {
    // key -> (state, version)
    data: Arc<Mutex<HashMap<String, (BucketState, u64)>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose time authority is `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { data: Arc::default(), clock }
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn now_ms(&self) -> Result<u64, TokenStoreError> {
        Ok(self.clock.now_millis())
    }

    async fn get_state(&self, key: &str) -> Result<Option<(BucketState, u64)>, TokenStoreError> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).copied())
    }

    async fn set_state(
        &self,
        key: &str,
        state: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, TokenStoreError> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);

        let next_version = match (guard.get(key), expected_version) {
            (None, None) => 1,
            (Some(&(_, current)), Some(expected)) if current == expected => current + 1,
            // Key appeared, vanished, or moved on since it was read.
            _ => return Ok(false),
        };

        guard.insert(key.to_string(), (state, next_version));
        Ok(true)
    }
}
