use super::model::{
    AttemptPatch, AttemptQuery, AttemptRecord, AttemptType, NewAttempt, NewPurchase, Purchase,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Durable store for attempt records and purchases.
///
/// The store assigns ids and `created_at` on insert. Attempt rows are append-mostly: the
/// only mutation is [`AuditStore::update_attempt`] for late-arriving fields.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<AttemptRecord, StoreError>;

    /// Patch an existing attempt. Errors with [`StoreError::NotFound`] for unknown ids.
    async fn update_attempt(&self, id: Uuid, patch: AttemptPatch) -> Result<(), StoreError>;

    /// Filtered, newest-first, ranged listing.
    async fn query_attempts(&self, query: &AttemptQuery) -> Result<Vec<AttemptRecord>, StoreError>;

    /// Attempt types of every record belonging to `user_id`, for summaries.
    async fn attempt_types(&self, user_id: &str) -> Result<Vec<AttemptType>, StoreError>;

    async fn insert_purchase(&self, purchase: NewPurchase) -> Result<Purchase, StoreError>;

    async fn get_purchase(&self, id: Uuid) -> Result<Option<Purchase>, StoreError>;
}

/// In-process audit store for single-instance deployments and tests.
///
/// Clones share the same tables.
#[derive(Clone, Debug)]
pub struct InMemoryAuditStore {
    attempts: Arc<RwLock<Vec<AttemptRecord>>>,
    purchases: Arc<RwLock<HashMap<Uuid, Purchase>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` to stamp `created_at`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: Arc::new(RwLock::new(Vec::new())),
            purchases: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Snapshot of every attempt, in insertion order.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn purchase_count(&self) -> usize {
        self.purchases.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<AttemptRecord, StoreError> {
        let record = attempt.into_record(Uuid::new_v4(), self.clock.now());
        self.attempts.write().unwrap_or_else(PoisonError::into_inner).push(record.clone());
        Ok(record)
    }

    async fn update_attempt(&self, id: Uuid, patch: AttemptPatch) -> Result<(), StoreError> {
        let mut guard = self.attempts.write().unwrap_or_else(PoisonError::into_inner);
        let record = guard
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(record);
        Ok(())
    }

    async fn query_attempts(&self, query: &AttemptQuery) -> Result<Vec<AttemptRecord>, StoreError> {
        let guard = self.attempts.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&AttemptRecord> = guard.iter().filter(|r| query.matches(r)).collect();
        // Stable sort over insertion order; reverse first so equal timestamps list newest first.
        matched.reverse();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(query.offset).take(limit).cloned().collect())
    }

    async fn attempt_types(&self, user_id: &str) -> Result<Vec<AttemptType>, StoreError> {
        let guard = self.attempts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .map(|r| r.attempt_type)
            .collect())
    }

    async fn insert_purchase(&self, purchase: NewPurchase) -> Result<Purchase, StoreError> {
        let row = Purchase {
            id: Uuid::new_v4(),
            user_id: purchase.user_id,
            quantity: purchase.quantity,
            total_price: purchase.total_price,
            status: purchase.status,
            created_at: self.clock.now(),
        };
        self.purchases.write().unwrap_or_else(PoisonError::into_inner).insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_purchase(&self, id: Uuid) -> Result<Option<Purchase>, StoreError> {
        Ok(self.purchases.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::model::PurchaseStatus;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn attempt(user: Option<&str>, t: AttemptType) -> NewAttempt {
        NewAttempt {
            user_id: user.map(str::to_string),
            attempt_type: t,
            response_status: t.status(),
            ..NewAttempt::default()
        }
    }

    #[tokio::test]
    async fn query_is_scoped_filtered_and_newest_first() {
        let clock = ManualClock::at_epoch_2024();
        let store = InMemoryAuditStore::with_clock(Arc::new(clock.clone()));
        store.insert_attempt(attempt(Some("a"), AttemptType::Success)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        store.insert_attempt(attempt(Some("b"), AttemptType::Success)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        store.insert_attempt(attempt(Some("a"), AttemptType::RateLimited)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        store.insert_attempt(attempt(None, AttemptType::AuthError)).await.unwrap();

        let all_a = store.query_attempts(&AttemptQuery::for_user("a")).await.unwrap();
        let types: Vec<_> = all_a.iter().map(|r| r.attempt_type).collect();
        assert_eq!(types, vec![AttemptType::RateLimited, AttemptType::Success]);

        let q = AttemptQuery { attempt_type: Some(AttemptType::Success), ..AttemptQuery::for_user("a") };
        assert_eq!(store.query_attempts(&q).await.unwrap().len(), 1);

        let paged = AttemptQuery { offset: 1, limit: Some(1), ..AttemptQuery::for_user("a") };
        let page = store.query_attempts(&paged).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].attempt_type, AttemptType::Success);
    }

    #[tokio::test]
    async fn update_patches_and_rejects_unknown_ids() {
        let store = InMemoryAuditStore::new();
        let rec = store.insert_attempt(attempt(Some("a"), AttemptType::DbError)).await.unwrap();
        let patch = AttemptPatch { response_status: Some(503), ..AttemptPatch::default() };
        store.update_attempt(rec.id, patch.clone()).await.unwrap();
        assert_eq!(store.attempts()[0].response_status, 503);

        let err = store.update_attempt(Uuid::new_v4(), patch).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn purchases_resolve_by_id() {
        let store = InMemoryAuditStore::new();
        let p = store
            .insert_purchase(NewPurchase {
                user_id: "a".into(),
                quantity: 2,
                total_price: 10.0,
                status: PurchaseStatus::Completed,
            })
            .await
            .unwrap();
        assert_eq!(store.get_purchase(p.id).await.unwrap(), Some(p));
        assert_eq!(store.get_purchase(Uuid::new_v4()).await.unwrap(), None);
    }
}
