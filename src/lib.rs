#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Cornstand 🌽
//!
//! Purchase admission control: each customer may complete one purchase per rolling window,
//! and every attempt, admitted or not, leaves an audit record.
//!
//! ## Features
//!
//! - **Token-bucket admission** over a shared compare-and-swap store, failing closed
//! - **Local deny cache** that short-circuits known-exhausted buckets without a store round trip
//! - **Attempt audit trail** that fails open and writes one record per request
//! - **Purchase workflow** with a stable error taxonomy (`auth_error`, `rate_limited`,
//!   `validation_error`, `db_error`, `internal_error`)
//! - **HTTP surface** built on axum (`POST /purchase`, `GET /history`)
//! - **Admission telemetry** as `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use cornstand::{InMemoryTokenStore, Principal, RateLimiter, TokenBucket};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bucket = TokenBucket::new(InMemoryTokenStore::new(), Duration::from_secs(60));
//!     let alice = Principal::new("alice");
//!
//!     let first = bucket.check_and_consume(&alice).await.unwrap();
//!     let second = bucket.check_and_consume(&alice).await.unwrap();
//!     assert!(first.is_allowed());
//!     assert!(!second.is_allowed());
//! }
//! ```

pub mod adaptive;
pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod purchase;
pub mod rate_limit;
pub mod response;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use api::{router, AppState};
pub use audit::{
    AttemptDescription, AttemptRecord, AttemptRecorder, AttemptType, AuditStore,
    InMemoryAuditStore, Purchase,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, LogFormat, PricePolicy};
pub use error::{ConfigError, IdentityError, LimiterError, StageError, StoreError, TokenStoreError};
pub use history::{HistoryParams, HistoryReply, HistoryService};
pub use identity::{IdentityService, Principal, StaticTokenIdentity};
pub use purchase::{PurchasePolicy, PurchaseReply, PurchaseResponse, PurchaseWorkflow};
pub use rate_limit::{
    Decision, DenyReason, InMemoryTokenStore, LocalDenyCache, RateLimiter, TokenBucket, TokenStore,
};
pub use response::{ErrorCode, ErrorResponse};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use timeout::StageTimeout;
