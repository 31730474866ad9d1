//! Purchase workflow: one request from identity to audit record.
//!
//! Stages run strictly in order:
//!
//! 1. resolve identity
//! 2. admission check (consumes the caller's token)
//! 3. validate quantity and price
//! 4. persist the purchase
//!
//! The outcome of whichever stage ends the request is turned into exactly one attempt record
//! and one response. Recording happens after the outcome is known, outside the stages, so a
//! panic inside a stage still produces a single `internal_error` record.
//!
//! Admission runs before validation, so a malformed request still spends the caller's slot
//! for the window. That includes bodies over the configured size limit: they are never
//! buffered, but they still produce a `validation_error` record.

use crate::adaptive::DynamicConfig;
use crate::audit::{
    AttemptDescription, AttemptRecorder, AttemptType, AuditStore, ClientMetadata, NewPurchase,
    Purchase, PurchaseStatus,
};
use crate::config::{Config, PricePolicy};
use crate::error::{IdentityError, StageError};
use crate::identity::{IdentityService, Principal};
use crate::rate_limit::{Decision, RateLimiter};
use crate::response::ErrorCode;
use crate::timeout::StageTimeout;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Purchase rules applied after admission.
#[derive(Debug, Clone)]
pub struct PurchasePolicy {
    pub max_quantity: i64,
    pub default_unit_price: f64,
    pub price_policy: PricePolicy,
    pub product_name: String,
    pub max_body_bytes: usize,
    /// Only used for the rate-limit message. Share the limiter's handle so the message follows
    /// live window changes.
    pub window: DynamicConfig<Duration>,
}

impl Default for PurchasePolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PurchasePolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            max_quantity: cfg.max_quantity,
            default_unit_price: cfg.unit_price,
            price_policy: cfg.price_policy,
            product_name: cfg.product_name.clone(),
            max_body_bytes: cfg.max_body_bytes,
            window: DynamicConfig::new(cfg.window()),
        }
    }
}

/// The purchase as returned to the caller. `price` is the total charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseView {
    pub id: Uuid,
    pub quantity: i64,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&Purchase> for PurchaseView {
    fn from(p: &Purchase) -> Self {
        Self { id: p.id, quantity: p.quantity, price: p.total_price, created_at: p.created_at }
    }
}

/// JSON body of a `POST /purchase` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase: Option<PurchaseView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    pub message: String,
    /// Whole seconds until the next allowed purchase.
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(rename = "nextPurchaseAt", skip_serializing_if = "Option::is_none")]
    pub next_purchase_at: Option<DateTime<Utc>>,
}

impl PurchaseResponse {
    fn failure(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            purchase: None,
            error: Some(error),
            message: message.into(),
            retry_after: None,
            next_purchase_at: None,
        }
    }
}

/// Status, body, and the id of the attempt record written for the request.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseReply {
    pub status: StatusCode,
    pub body: PurchaseResponse,
    pub attempt_type: AttemptType,
    /// `None` if the audit write failed.
    pub attempt_id: Option<Uuid>,
}

/// What is known about the request so far; survives a panic in a later stage.
#[derive(Debug, Default)]
struct Progress {
    principal: Option<Principal>,
    quantity: Option<i64>,
    requested_price: Option<f64>,
    total_price: Option<f64>,
}

/// The request body as it reached the workflow.
#[derive(Debug, Clone, Copy)]
enum Payload<'a> {
    Read(&'a [u8]),
    /// The transport gave up on the body (too long, or the read failed).
    Unreadable(&'a str),
}

/// Terminal state of one request.
#[derive(Debug)]
enum Outcome {
    Unauthenticated(String),
    IdentityUnavailable(String),
    RateLimited { reset_at: DateTime<Utc>, retry_after: u64 },
    LimiterUnavailable(String),
    Invalid { code: ErrorCode, message: String, detail: String },
    PersistFailed(String),
    Completed(Purchase),
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ValidatedInput {
    quantity: i64,
    total_price: f64,
}

/// Orchestrates a single purchase request.
#[derive(Clone)]
pub struct PurchaseWorkflow {
    identity: Arc<dyn IdentityService>,
    limiter: Arc<dyn RateLimiter>,
    store: Arc<dyn AuditStore>,
    recorder: AttemptRecorder,
    policy: PurchasePolicy,
    timeout: StageTimeout,
}

impl std::fmt::Debug for PurchaseWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseWorkflow")
            .field("identity", &self.identity.name())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PurchaseWorkflow {
    /// Build a workflow whose recorder writes to the same store as purchases.
    ///
    /// The workflow reads no clock of its own: admission time comes from the limiter's shared
    /// store and record timestamps from the audit store.
    pub fn new(
        identity: Arc<dyn IdentityService>,
        limiter: Arc<dyn RateLimiter>,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            identity,
            limiter,
            recorder: AttemptRecorder::new(store.clone()),
            store,
            policy: PurchasePolicy::default(),
            timeout: StageTimeout::default(),
        }
    }

    pub fn with_policy(mut self, policy: PurchasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deadline for every collaborator call, including the recorder's write.
    pub fn with_timeout(mut self, timeout: StageTimeout) -> Self {
        self.timeout = timeout;
        self.recorder = self.recorder.with_timeout(timeout);
        self
    }

    pub fn with_recorder(mut self, recorder: AttemptRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn policy(&self) -> &PurchasePolicy {
        &self.policy
    }

    /// Handle one purchase request. Always returns a reply and always records one attempt.
    pub async fn submit(&self, headers: &HeaderMap, body: &[u8]) -> PurchaseReply {
        self.handle(headers, Payload::Read(body)).await
    }

    /// Handle a request whose body could not be read, e.g. because it exceeded
    /// [`PurchasePolicy::max_body_bytes`]. Identity and admission still run first, and the
    /// request is recorded like any other.
    pub async fn submit_unreadable(&self, headers: &HeaderMap, reason: &str) -> PurchaseReply {
        self.handle(headers, Payload::Unreadable(reason)).await
    }

    async fn handle(&self, headers: &HeaderMap, payload: Payload<'_>) -> PurchaseReply {
        let mut progress = Progress::default();
        let outcome = match AssertUnwindSafe(self.run(headers, payload, &mut progress))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
        };
        let stored_body = match payload {
            Payload::Read(body) if !body.is_empty() && body.len() <= self.policy.max_body_bytes => {
                Some(String::from_utf8_lossy(body).into_owned())
            }
            _ => None,
        };
        self.conclude(outcome, progress, headers, stored_body).await
    }

    async fn run(&self, headers: &HeaderMap, payload: Payload<'_>, progress: &mut Progress) -> Outcome {
        let principal = match self.timeout.run(self.identity.current_principal(headers)).await {
            Ok(p) => p,
            Err(StageError::Inner(IdentityError::Unauthenticated(reason))) => {
                return Outcome::Unauthenticated(reason)
            }
            Err(e) => return Outcome::IdentityUnavailable(e.to_string()),
        };
        progress.principal = Some(principal.clone());

        match self.timeout.run(self.limiter.check_and_consume(&principal)).await {
            Ok(Decision::Allowed { .. }) => {}
            Ok(Decision::Denied { reset_at, wait, .. }) => {
                return Outcome::RateLimited { reset_at, retry_after: retry_after_secs(wait) }
            }
            // Fail closed: an unreachable or slow limiter is never a grant.
            Err(e) => return Outcome::LimiterUnavailable(e.to_string()),
        }

        let input = match self.validate(payload, progress) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };

        let new_purchase = NewPurchase {
            user_id: principal.as_str().to_string(),
            quantity: input.quantity,
            total_price: input.total_price,
            status: PurchaseStatus::Completed,
        };
        match self.timeout.run(self.store.insert_purchase(new_purchase)).await {
            Ok(purchase) => Outcome::Completed(purchase),
            Err(e) => Outcome::PersistFailed(e.to_string()),
        }
    }

    fn validate(&self, payload: Payload<'_>, progress: &mut Progress) -> Result<ValidatedInput, Outcome> {
        let limit = self.policy.max_body_bytes;
        let body = match payload {
            Payload::Read(body) if body.len() <= limit => body,
            Payload::Read(body) => {
                return Err(too_large(limit, format!("body of {} bytes", body.len())))
            }
            Payload::Unreadable(reason) => return Err(too_large(limit, reason.to_string())),
        };

        // Unparsable or non-object bodies fall back to defaults.
        let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let field = |name: &str| parsed.get(name).filter(|v| !v.is_null());

        let max_quantity = self.policy.max_quantity;
        let quantity = match field("quantity") {
            None => 1,
            Some(v) => parse_quantity(v, max_quantity).ok_or_else(|| Outcome::Invalid {
                code: ErrorCode::InvalidQuantity,
                message: format!("Quantity must be a number between 1 and {}", max_quantity),
                detail: format!("quantity {} outside 1..={}", v, max_quantity),
            })?,
        };
        progress.quantity = Some(quantity);

        let requested_price = match field("price") {
            None => None,
            Some(v) => Some(parse_price(v).ok_or_else(|| Outcome::Invalid {
                code: ErrorCode::InvalidPrice,
                message: "Price must be a positive number".to_string(),
                detail: format!("price {} is not a positive number", v),
            })?),
        };
        progress.requested_price = requested_price;

        let unit_price = match self.policy.price_policy {
            PricePolicy::TrustCaller => requested_price.unwrap_or(self.policy.default_unit_price),
            PricePolicy::Catalog => self.policy.default_unit_price,
        };
        let total_price = unit_price * quantity as f64;
        if !total_price.is_finite() {
            return Err(Outcome::Invalid {
                code: ErrorCode::InvalidPrice,
                message: "Price is too large".to_string(),
                detail: format!("{} x {} overflows the total", quantity, unit_price),
            });
        }
        progress.total_price = Some(total_price);
        Ok(ValidatedInput { quantity, total_price })
    }

    async fn conclude(
        &self,
        outcome: Outcome,
        progress: Progress,
        headers: &HeaderMap,
        request_body: Option<String>,
    ) -> PurchaseReply {
        let mut response;
        let attempt_type;
        let record_code: &str;
        let record_detail: Option<String>;
        let mut reset_at = None;
        let mut purchase_id = None;

        match outcome {
            Outcome::Unauthenticated(reason) => {
                attempt_type = AttemptType::AuthError;
                record_code = ErrorCode::Unauthorized.as_str();
                record_detail = Some(reason);
                response = PurchaseResponse::failure(
                    ErrorCode::Unauthorized,
                    format!("You must be logged in to purchase {}", self.policy.product_name),
                );
            }
            Outcome::IdentityUnavailable(detail) => {
                attempt_type = AttemptType::InternalError;
                record_code = "IDENTITY_UNAVAILABLE";
                record_detail = Some(detail);
                response = internal_error_response();
            }
            Outcome::RateLimited { reset_at: at, retry_after } => {
                attempt_type = AttemptType::RateLimited;
                record_code = ErrorCode::RateLimited.as_str();
                record_detail = Some(format!("next purchase allowed at {}", at.to_rfc3339()));
                reset_at = Some(at);
                response = PurchaseResponse::failure(
                    ErrorCode::RateLimited,
                    format!(
                        "You can only buy {} once {}",
                        self.policy.product_name,
                        describe_window(*self.policy.window.get())
                    ),
                );
                response.retry_after = Some(retry_after);
                response.next_purchase_at = Some(at);
            }
            Outcome::LimiterUnavailable(detail) => {
                attempt_type = AttemptType::InternalError;
                record_code = "RATE_LIMITER_UNAVAILABLE";
                record_detail = Some(detail);
                response = internal_error_response();
            }
            Outcome::Invalid { code, message, detail } => {
                attempt_type = AttemptType::ValidationError;
                record_code = code.as_str();
                record_detail = Some(detail);
                response = PurchaseResponse::failure(code, message);
            }
            Outcome::PersistFailed(detail) => {
                attempt_type = AttemptType::DbError;
                record_code = ErrorCode::PurchaseFailed.as_str();
                record_detail = Some(detail);
                response = PurchaseResponse::failure(
                    ErrorCode::PurchaseFailed,
                    format!("Failed to process {} purchase. Please try again.", self.policy.product_name),
                );
            }
            Outcome::Completed(purchase) => {
                attempt_type = AttemptType::Success;
                record_code = "";
                record_detail = None;
                purchase_id = Some(purchase.id);
                response = PurchaseResponse {
                    success: true,
                    purchase: Some(PurchaseView::from(&purchase)),
                    error: None,
                    message: format!(
                        "Successfully purchased {} {}!",
                        purchase.quantity, self.policy.product_name
                    ),
                    retry_after: None,
                    next_purchase_at: None,
                };
            }
            Outcome::Panicked(detail) => {
                attempt_type = AttemptType::InternalError;
                record_code = ErrorCode::InternalError.as_str();
                record_detail = Some(detail);
                response = internal_error_response();
            }
        }

        let status = StatusCode::from_u16(attempt_type.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let principal_label = progress.principal.as_ref().map(Principal::to_string);

        match attempt_type {
            AttemptType::Success => tracing::info!(
                target: "cornstand::purchase",
                principal = principal_label.as_deref().unwrap_or("-"),
                quantity = progress.quantity,
                total_price = progress.total_price,
                "purchase completed"
            ),
            AttemptType::DbError | AttemptType::InternalError => tracing::error!(
                target: "cornstand::purchase",
                principal = principal_label.as_deref().unwrap_or("-"),
                attempt_type = %attempt_type,
                code = record_code,
                detail = record_detail.as_deref().unwrap_or(""),
                "purchase failed"
            ),
            _ => tracing::info!(
                target: "cornstand::purchase",
                principal = principal_label.as_deref().unwrap_or("-"),
                attempt_type = %attempt_type,
                code = record_code,
                "purchase rejected"
            ),
        }

        let description = AttemptDescription {
            attempt_type,
            principal: progress.principal,
            quantity: progress.quantity,
            requested_price: progress.requested_price,
            total_price: progress.total_price,
            error_code: (!record_code.is_empty()).then(|| record_code.to_string()),
            error_message: record_detail,
            rate_limit_reset_at: reset_at,
            purchase_id,
            response_status: status.as_u16(),
            client: ClientMetadata::from_headers(headers),
            request_body,
        };
        let attempt_id = self.recorder.record(description).await;

        PurchaseReply { status, body: response, attempt_type, attempt_id }
    }
}

fn describe_window(window: Duration) -> String {
    match window.as_secs() {
        60 => "per minute".to_string(),
        3600 => "per hour".to_string(),
        1 => "per second".to_string(),
        n => format!("every {} seconds", n),
    }
}

fn too_large(limit: usize, detail: String) -> Outcome {
    Outcome::Invalid {
        code: ErrorCode::PayloadTooLarge,
        message: format!("Request body must not exceed {} bytes", limit),
        detail,
    }
}

fn internal_error_response() -> PurchaseResponse {
    PurchaseResponse::failure(
        ErrorCode::InternalError,
        "An unexpected error occurred. Please try again.",
    )
}

/// `ceil(wait / 1s)`, at least 1 for any non-zero wait.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Integer in `1..=max`. Integral floats (`3.0`) count as integers; strings do not.
fn parse_quantity(v: &Value, max: i64) -> Option<i64> {
    let n = match v.as_i64() {
        Some(n) => n,
        None => {
            let f = v.as_f64()?;
            if f.fract() != 0.0 || f.abs() > 9_007_199_254_740_992.0 {
                return None;
            }
            f as i64
        }
    };
    (1..=max).contains(&n).then_some(n)
}

fn parse_price(v: &Value) -> Option<f64> {
    v.as_f64().filter(|p| p.is_finite() && *p > 0.0)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
