//! Deadline for a single collaborator call.

use crate::error::StageError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Default deadline applied to identity, limiter, and store calls.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct StageTimeout {
    duration: Duration,
}

impl Default for StageTimeout {
    fn default() -> Self {
        Self { duration: DEFAULT_STAGE_TIMEOUT }
    }
}

impl StageTimeout {
    /// Create a stage timeout. Zero durations are bumped to one millisecond.
    pub fn new(duration: Duration) -> Self {
        Self { duration: duration.max(Duration::from_millis(1)) }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `fut`, mapping its error into [`StageError::Inner`] and a missed deadline into
    /// [`StageError::Timeout`].
    pub async fn run<T, E, Fut>(&self, fut: Fut) -> Result<T, StageError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, fut).await {
            Ok(result) => result.map_err(StageError::Inner),
            Err(_) => Err(StageError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
