//! JSONL sink for `cornstand` admission events. Writes one event per line.
//! Always appends; bring your own path and rotation.

use cornstand::telemetry::{AdmissionEvent, TelemetrySink};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<AdmissionEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_line(&event);
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "cornstand::telemetry", path = %path.display(), "event appended");
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

/// The event's JSON plus a `ts` field (RFC 3339, UTC), newline-terminated.
fn event_line(event: &AdmissionEvent) -> String {
    let mut value = event.to_json();
    if let Value::Object(map) = &mut value {
        map.insert("ts".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
    }
    value.to_string() + "\n"
}
