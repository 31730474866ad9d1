//! Clock abstractions shared by the limiter and the stores.
//!
//! Every timestamp the service produces (`reset_at`, `created_at`) comes from one injected
//! [`Clock`], so grant decisions and audit rows are ordered against the same time source.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since the Unix epoch, clamped at zero.
    fn now_millis(&self) -> u64 {
        u64::try_from(self.now().timestamp_millis()).unwrap_or(0)
    }
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same instant, so a test can hand one clone to the service and keep
/// another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Start at a fixed, round instant (2024-01-01T00:00:00Z).
    pub fn at_epoch_2024() -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let step = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::MAX);
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += step;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convert epoch milliseconds back into a UTC timestamp.
pub fn from_millis(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
