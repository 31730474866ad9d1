//! Read side of the audit trail: a caller's own attempts, newest first, with a summary.

use crate::audit::{AttemptQuery, AttemptRecord, AttemptType, AuditStore};
use crate::error::{IdentityError, StageError};
use crate::identity::IdentityService;
use crate::response::{ErrorCode, ErrorResponse};
use crate::timeout::StageTimeout;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 100;

/// Paging and filter parameters after lenient parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryParams {
    pub limit: usize,
    pub offset: usize,
    pub attempt_type: Option<AttemptType>,
}

impl Default for HistoryParams {
    fn default() -> Self {
        Self { limit: DEFAULT_LIMIT, offset: 0, attempt_type: None }
    }
}

impl HistoryParams {
    /// Unparsable numbers fall back to defaults; `limit` is clamped to `1..=100`, negative
    /// offsets to 0. An unknown `type` is ignored rather than rejected.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let get = |k: &str| query.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());
        let limit = get("limit")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|n| n.clamp(1, MAX_LIMIT as i64) as usize)
            .unwrap_or(DEFAULT_LIMIT);
        let offset = get("offset")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|n| n.max(0) as usize)
            .unwrap_or(0);
        let attempt_type = get("type").and_then(|v| v.parse().ok());
        Self { limit, offset, attempt_type }
    }
}

/// One attempt as shown to its owner. Client metadata and the raw body stay server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub attempt_type: AttemptType,
    pub quantity: Option<i64>,
    pub requested_price: Option<f64>,
    pub total_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub purchase_id: Option<Uuid>,
    pub response_status: u16,
    pub created_at: DateTime<Utc>,
}

impl From<AttemptRecord> for HistoryEntry {
    fn from(r: AttemptRecord) -> Self {
        Self {
            id: r.id,
            attempt_type: r.attempt_type,
            quantity: r.quantity,
            requested_price: r.requested_price,
            total_price: r.total_price,
            error_code: r.error_code,
            error_message: r.error_message,
            rate_limit_reset_at: r.rate_limit_reset_at,
            purchase_id: r.purchase_id,
            response_status: r.response_status,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total_attempts: usize,
    pub successful_purchases: usize,
    pub rate_limited_attempts: usize,
    /// Every non-success attempt, rate-limited ones included.
    pub failed_attempts: usize,
}

impl HistorySummary {
    pub fn from_types(types: &[AttemptType]) -> Self {
        let count = |t: AttemptType| types.iter().filter(|x| **x == t).count();
        let successful = count(AttemptType::Success);
        Self {
            total_attempts: types.len(),
            successful_purchases: successful,
            rate_limited_attempts: count(AttemptType::RateLimited),
            failed_attempts: types.len() - successful,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub success: bool,
    pub attempts: Vec<HistoryEntry>,
    pub summary: HistorySummary,
    pub pagination: Pagination,
}

/// Either a page or an error body, with the status to send.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryReply {
    Page(HistoryPage),
    Error { status: StatusCode, body: ErrorResponse },
}

impl HistoryReply {
    fn error(status: StatusCode, code: ErrorCode, message: &str) -> Self {
        HistoryReply::Error { status, body: ErrorResponse::new(code, message) }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HistoryReply::Page(_) => StatusCode::OK,
            HistoryReply::Error { status, .. } => *status,
        }
    }
}

#[derive(Clone)]
pub struct HistoryService {
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn AuditStore>,
    timeout: StageTimeout,
}

impl std::fmt::Debug for HistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryService")
            .field("identity", &self.identity.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HistoryService {
    pub fn new(identity: Arc<dyn IdentityService>, store: Arc<dyn AuditStore>) -> Self {
        Self { identity, store, timeout: StageTimeout::default() }
    }

    pub fn with_timeout(mut self, timeout: StageTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn fetch(&self, headers: &HeaderMap, params: HistoryParams) -> HistoryReply {
        let principal = match self.timeout.run(self.identity.current_principal(headers)).await {
            Ok(p) => p,
            Err(StageError::Inner(IdentityError::Unauthenticated(_))) => {
                return HistoryReply::error(
                    StatusCode::UNAUTHORIZED,
                    ErrorCode::Unauthorized,
                    "You must be logged in to view your purchase history",
                )
            }
            Err(e) => {
                tracing::error!(target: "cornstand::history", error = %e, "identity lookup failed");
                return HistoryReply::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InternalError,
                    "An unexpected error occurred while fetching purchase history",
                );
            }
        };

        let query = AttemptQuery {
            attempt_type: params.attempt_type,
            offset: params.offset,
            limit: Some(params.limit),
            ..AttemptQuery::for_user(principal.as_str())
        };
        let attempts = match self.timeout.run(self.store.query_attempts(&query)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(
                    target: "cornstand::history",
                    principal = %principal,
                    error = %e,
                    "failed to fetch purchase attempts"
                );
                return HistoryReply::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::FetchFailed,
                    "Failed to fetch purchase history",
                );
            }
        };

        let summary = match self.timeout.run(self.store.attempt_types(principal.as_str())).await {
            Ok(types) => HistorySummary::from_types(&types),
            Err(e) => {
                tracing::warn!(
                    target: "cornstand::history",
                    principal = %principal,
                    error = %e,
                    "summary unavailable, reporting zeros"
                );
                HistorySummary::default()
            }
        };

        let has_more = attempts.len() == params.limit;
        HistoryReply::Page(HistoryPage {
            success: true,
            attempts: attempts.into_iter().map(HistoryEntry::from).collect(),
            summary,
            pagination: Pagination { limit: params.limit, offset: params.offset, has_more },
        })
    }
}
