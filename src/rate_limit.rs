//! Purchase admission limiting.
//!
//! - [`RateLimiter`]: the admission contract used by the purchase workflow.
//! - [`Decision`]: the result of a check (allowed / denied, with the next refill instant).
//! - [`strategies::TokenBucket`]: per-principal token bucket with a rolling refill.
//! - [`store::TokenStore`]: shared bucket state with compare-and-swap writes, so several
//!   process instances can share one authoritative bucket per principal.
//! - [`cache::LocalDenyCache`]: optional in-process fast path that can only reject.
//!
//! The limiter fails closed: any store failure surfaces as an error, which callers must
//! treat as "not allowed".

use crate::error::LimiterError;
use crate::identity::Principal;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod cache;
pub mod store;
pub mod strategies;

pub use cache::LocalDenyCache;
pub use store::{BucketState, InMemoryTokenStore, TokenStore};
pub use strategies::TokenBucket;

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The authoritative bucket is empty.
    Exhausted,
    /// The local cache already knows the bucket is empty.
    LocalCache,
    /// Optimistic writes kept losing races against concurrent requests.
    Contention,
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed; one token was consumed.
    Allowed {
        /// Tokens left after this grant.
        remaining: u32,
        /// When the next token refills (for capacity 1, the next allowed instant).
        reset_at: DateTime<Utc>,
    },
    /// The request is denied.
    Denied {
        /// When the principal will next be allowed. Always after the decision time.
        reset_at: DateTime<Utc>,
        /// `reset_at` minus the decision time.
        wait: Duration,
        reason: DenyReason,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Decision::Allowed { reset_at, .. } | Decision::Denied { reset_at, .. } => *reset_at,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }
}

/// Admission contract: atomically check for a token and consume it.
///
/// Implementations must guarantee that concurrent calls for the same principal never grant
/// more tokens than the bucket holds. The limiter reads time from its shared backing store,
/// so callers do not supply it.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check_and_consume(&self, principal: &Principal) -> Result<Decision, LimiterError>;
}
