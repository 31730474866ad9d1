use super::events::AdmissionEvent;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        if let Err(e) = ready_sink.call(event).await {
            tracing::debug!(target: "cornstand::telemetry", error = %e, "telemetry sink rejected event");
        }
    }
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        tracing::info!(
            target: "cornstand::limiter",
            kind = event.kind(),
            principal = %event.principal(),
            event = %event,
            "admission_event"
        );
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory. Oldest events are evicted at capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024)))),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Number of retained events of `kind` (see [`AdmissionEvent::kind`]).
    pub fn count_kind(&self, kind: &str) -> usize {
        self.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.lock();
        while guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
