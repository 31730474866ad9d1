//! Rows of the audit log store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Outcome class of one purchase request. Exactly one per attempt record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    Success,
    RateLimited,
    ValidationError,
    AuthError,
    DbError,
    #[default]
    InternalError,
}

impl AttemptType {
    pub const ALL: [AttemptType; 6] = [
        AttemptType::Success,
        AttemptType::RateLimited,
        AttemptType::ValidationError,
        AttemptType::AuthError,
        AttemptType::DbError,
        AttemptType::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptType::Success => "success",
            AttemptType::RateLimited => "rate_limited",
            AttemptType::ValidationError => "validation_error",
            AttemptType::AuthError => "auth_error",
            AttemptType::DbError => "db_error",
            AttemptType::InternalError => "internal_error",
        }
    }

    /// HTTP status every request of this type is answered with.
    pub fn status(&self) -> u16 {
        match self {
            AttemptType::Success => 200,
            AttemptType::RateLimited => 429,
            AttemptType::ValidationError => 400,
            AttemptType::AuthError => 401,
            AttemptType::DbError | AttemptType::InternalError => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptType::Success)
    }
}

impl fmt::Display for AttemptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown attempt type tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attempt type: {0}")]
pub struct UnknownAttemptType(pub String);

impl FromStr for AttemptType {
    type Err = UnknownAttemptType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownAttemptType(s.to_string()))
    }
}

/// Durable audit entry for one purchase request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    /// Null only when identity resolution failed.
    pub user_id: Option<String>,
    pub attempt_type: AttemptType,
    pub quantity: Option<i64>,
    pub requested_price: Option<f64>,
    pub total_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Set only for `rate_limited`.
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    /// Set only for `success`.
    pub purchase_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Raw inbound payload.
    pub request_body: Option<String>,
    pub response_status: u16,
    pub created_at: DateTime<Utc>,
}

/// An attempt record before the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewAttempt {
    pub user_id: Option<String>,
    pub attempt_type: AttemptType,
    pub quantity: Option<i64>,
    pub requested_price: Option<f64>,
    pub total_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub purchase_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_body: Option<String>,
    pub response_status: u16,
}

impl NewAttempt {
    /// Finalize into a stored row.
    pub fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> AttemptRecord {
        AttemptRecord {
            id,
            user_id: self.user_id,
            attempt_type: self.attempt_type,
            quantity: self.quantity,
            requested_price: self.requested_price,
            total_price: self.total_price,
            error_code: self.error_code,
            error_message: self.error_message,
            rate_limit_reset_at: self.rate_limit_reset_at,
            purchase_id: self.purchase_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            request_body: self.request_body,
            response_status: self.response_status,
            created_at,
        }
    }
}

/// Late-arriving fields for an existing attempt. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttemptPatch {
    pub attempt_type: Option<AttemptType>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub purchase_id: Option<Uuid>,
    pub response_status: Option<u16>,
    pub total_price: Option<f64>,
}

impl AttemptPatch {
    pub fn is_empty(&self) -> bool {
        *self == AttemptPatch::default()
    }

    pub fn apply(&self, record: &mut AttemptRecord) {
        if let Some(t) = self.attempt_type {
            record.attempt_type = t;
        }
        if let Some(code) = &self.error_code {
            record.error_code = Some(code.clone());
        }
        if let Some(msg) = &self.error_message {
            record.error_message = Some(msg.clone());
        }
        if let Some(id) = self.purchase_id {
            record.purchase_id = Some(id);
        }
        if let Some(status) = self.response_status {
            record.response_status = status;
        }
        if let Some(total) = self.total_price {
            record.total_price = Some(total);
        }
    }
}

/// Filter, order and range for attempt queries. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttemptQuery {
    pub user_id: Option<String>,
    pub attempt_type: Option<AttemptType>,
    pub offset: usize,
    /// `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

impl AttemptQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self { user_id: Some(user_id.into()), ..Self::default() }
    }

    pub fn matches(&self, record: &AttemptRecord) -> bool {
        let user_ok = match &self.user_id {
            Some(u) => record.user_id.as_deref() == Some(u.as_str()),
            None => true,
        };
        let type_ok = self.attempt_type.map_or(true, |t| record.attempt_type == t);
        user_ok && type_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Completed,
    Pending,
    Failed,
}

/// A committed purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: String,
    pub quantity: i64,
    pub total_price: f64,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
}

/// A purchase before the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPurchase {
    pub user_id: String,
    pub quantity: i64,
    pub total_price: f64,
    pub status: PurchaseStatus,
}
