use std::fmt;
use std::time::Duration;

use serde_json::json;

/// Events emitted by the admission limiter.
///
/// One event per `check_and_consume` call. Events describe the limiter's behaviour; the
/// per-request audit trail lives in the attempt store, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A token was consumed.
    Granted {
        principal: String,
        /// Tokens left in the bucket after this grant.
        remaining: u32,
    },
    /// The authoritative store reported an empty bucket.
    Denied {
        principal: String,
        /// Time until the next token refills.
        wait: Duration,
    },
    /// The local cache rejected the request without consulting the store.
    FastPathRejected { principal: String, wait: Duration },
    /// Compare-and-swap kept losing races; the request was denied.
    Contended { principal: String, attempts: u32 },
    /// The token store failed; the request was denied.
    StoreUnavailable { principal: String, error: String },
}

impl AdmissionEvent {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Granted { .. } => "admission_granted",
            AdmissionEvent::Denied { .. } => "admission_denied",
            AdmissionEvent::FastPathRejected { .. } => "admission_fast_path_rejected",
            AdmissionEvent::Contended { .. } => "admission_contended",
            AdmissionEvent::StoreUnavailable { .. } => "admission_store_unavailable",
        }
    }

    pub fn principal(&self) -> &str {
        match self {
            AdmissionEvent::Granted { principal, .. }
            | AdmissionEvent::Denied { principal, .. }
            | AdmissionEvent::FastPathRejected { principal, .. }
            | AdmissionEvent::Contended { principal, .. }
            | AdmissionEvent::StoreUnavailable { principal, .. } => principal,
        }
    }

    pub fn is_grant(&self) -> bool {
        matches!(self, AdmissionEvent::Granted { .. })
    }

    /// Render as a flat JSON object, one key per field.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AdmissionEvent::Granted { principal, remaining } => {
                json!({ "kind": self.kind(), "principal": principal, "remaining": remaining })
            }
            AdmissionEvent::Denied { principal, wait }
            | AdmissionEvent::FastPathRejected { principal, wait } => json!({
                "kind": self.kind(),
                "principal": principal,
                "wait_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            }),
            AdmissionEvent::Contended { principal, attempts } => {
                json!({ "kind": self.kind(), "principal": principal, "attempts": attempts })
            }
            AdmissionEvent::StoreUnavailable { principal, error } => {
                json!({ "kind": self.kind(), "principal": principal, "error": error })
            }
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Granted { principal, remaining } => {
                write!(f, "Admission granted to {} ({} remaining)", principal, remaining)
            }
            AdmissionEvent::Denied { principal, wait } => {
                write!(f, "Admission denied for {} (wait {:?})", principal, wait)
            }
            AdmissionEvent::FastPathRejected { principal, wait } => {
                write!(f, "Admission rejected from local cache for {} (wait {:?})", principal, wait)
            }
            AdmissionEvent::Contended { principal, attempts } => {
                write!(f, "Admission contended for {} after {} attempts", principal, attempts)
            }
            AdmissionEvent::StoreUnavailable { principal, error } => {
                write!(f, "Token store unavailable for {}: {}", principal, error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_carries_kind_and_principal() {
        let ev = AdmissionEvent::Denied { principal: "u-1".into(), wait: Duration::from_secs(59) };
        let v = ev.to_json();
        assert_eq!(v["kind"], "admission_denied");
        assert_eq!(v["principal"], "u-1");
        assert_eq!(v["wait_ms"], 59_000);
    }

    #[test]
    fn display_is_human_readable() {
        let ev = AdmissionEvent::Granted { principal: "u-1".into(), remaining: 0 };
        assert_eq!(ev.to_string(), "Admission granted to u-1 (0 remaining)");
        assert!(ev.is_grant());
    }
}
