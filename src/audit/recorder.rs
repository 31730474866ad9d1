use super::model::{AttemptPatch, AttemptType, NewAttempt};
use super::store::AuditStore;
use crate::identity::Principal;
use crate::timeout::StageTimeout;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use http::header::USER_AGENT;
use http::HeaderMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

/// Placeholder recorded when no proxy header names the client.
pub const LOOPBACK_IP: &str = "127.0.0.1";

/// Proxy headers consulted for the client address, highest priority first.
const SINGLE_VALUE_IP_HEADERS: [&str; 2] = ["x-real-ip", "cf-connecting-ip"];

/// Forensic request metadata. Best-effort and never used for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self { ip_address: Some(client_ip(headers)), user_agent: header_str(headers, USER_AGENT.as_str()) }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First entry of `x-forwarded-for`, then `x-real-ip`, then `cf-connecting-ip`, then loopback.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = header_str(headers, "x-forwarded-for").and_then(|v| {
        v.split(',').next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    });
    forwarded
        .or_else(|| SINGLE_VALUE_IP_HEADERS.iter().find_map(|h| header_str(headers, h)))
        .unwrap_or_else(|| LOOPBACK_IP.to_string())
}

/// Everything known about one request at the moment its outcome is decided.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttemptDescription {
    pub attempt_type: AttemptType,
    pub principal: Option<Principal>,
    pub quantity: Option<i64>,
    pub requested_price: Option<f64>,
    pub total_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub purchase_id: Option<Uuid>,
    pub response_status: u16,
    pub client: ClientMetadata,
    pub request_body: Option<String>,
}

impl AttemptDescription {
    fn into_new_attempt(self) -> NewAttempt {
        // Field population rules: reset only for rate_limited, purchase only for success,
        // error details only for failures.
        let is_success = self.attempt_type.is_success();
        NewAttempt {
            user_id: self.principal.map(|p| p.as_str().to_string()),
            attempt_type: self.attempt_type,
            quantity: self.quantity,
            requested_price: self.requested_price,
            total_price: self.total_price,
            error_code: self.error_code.filter(|_| !is_success),
            error_message: self.error_message.filter(|_| !is_success),
            rate_limit_reset_at: self
                .rate_limit_reset_at
                .filter(|_| self.attempt_type == AttemptType::RateLimited),
            purchase_id: self.purchase_id.filter(|_| is_success),
            ip_address: self.client.ip_address,
            user_agent: self.client.user_agent,
            request_body: self.request_body,
            response_status: self.response_status,
        }
    }
}

/// Writes one attempt record per request.
///
/// Fails open: a lost record is logged and reported as `None`/`false`, never as an error,
/// so an audit outage can neither block nor fail a purchase. A store that panics counts as
/// a lost record.
#[derive(Clone)]
pub struct AttemptRecorder {
    store: Arc<dyn AuditStore>,
    timeout: StageTimeout,
}

impl std::fmt::Debug for AttemptRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptRecorder")
            .field("store", &"<dyn AuditStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AttemptRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store, timeout: StageTimeout::default() }
    }

    pub fn with_timeout(mut self, timeout: StageTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Persist `description`. Returns the new record id, or `None` if the write failed.
    pub async fn record(&self, description: AttemptDescription) -> Option<Uuid> {
        let attempt_type = description.attempt_type;
        let new_attempt = description.into_new_attempt();
        let write = AssertUnwindSafe(self.timeout.run(self.store.insert_attempt(new_attempt)))
            .catch_unwind()
            .await;
        match write {
            Err(_) => {
                tracing::error!(
                    target: "cornstand::recorder",
                    attempt_type = %attempt_type,
                    "audit store panicked while recording purchase attempt"
                );
                None
            }
            Ok(Ok(record)) => {
                tracing::debug!(
                    target: "cornstand::recorder",
                    id = %record.id,
                    attempt_type = %attempt_type,
                    "attempt recorded"
                );
                Some(record.id)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "cornstand::recorder",
                    attempt_type = %attempt_type,
                    error = %e,
                    "failed to record purchase attempt"
                );
                None
            }
        }
    }

    /// Apply late-arriving fields to an existing record. Returns `false` if the update failed.
    pub async fn update(&self, id: Uuid, patch: AttemptPatch) -> bool {
        if patch.is_empty() {
            return true;
        }
        let write = AssertUnwindSafe(self.timeout.run(self.store.update_attempt(id, patch)))
            .catch_unwind()
            .await;
        match write {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(target: "cornstand::recorder", %id, error = %e, "failed to update purchase attempt");
                false
            }
            Err(_) => {
                tracing::error!(target: "cornstand::recorder", %id, "audit store panicked while updating purchase attempt");
                false
            }
        }
    }
}
