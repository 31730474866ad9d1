//! Error types for the admission core.
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a stage call (identity, limiter, store) wrapped in a deadline.
///
/// A timeout is always a failure of the stage; callers must never read it as a grant.
#[derive(Debug, Clone)]
pub enum StageError<E> {
    /// The stage exceeded its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The underlying collaborator failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for StageError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "stage timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for StageError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }
}

impl<E> StageError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }
}

/// Failure reported by the durable audit store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failure reported by the shared token store backing the limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenStoreError {
    #[error("token store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of the admission limiter itself. The workflow treats every variant as a denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error(transparent)]
    Store(#[from] TokenStoreError),
}

/// Failure resolving the caller's identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No credentials, or credentials that do not map to a principal.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The identity provider could not be reached.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Invalid service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}
