//! Attempt audit trail.
//!
//! Every purchase request, whatever its outcome, leaves exactly one [`AttemptRecord`] in the
//! [`AuditStore`]. The [`AttemptRecorder`] is the only writer on the request path and it
//! never fails its caller.

pub mod model;
pub mod recorder;
pub mod store;

pub use model::{
    AttemptPatch, AttemptQuery, AttemptRecord, AttemptType, NewAttempt, NewPurchase, Purchase,
    PurchaseStatus, UnknownAttemptType,
};
pub use recorder::{client_ip, AttemptDescription, AttemptRecorder, ClientMetadata, LOOPBACK_IP};
pub use store::{AuditStore, InMemoryAuditStore};
