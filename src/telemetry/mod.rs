//! Admission telemetry.
//!
//! The limiter emits one [`AdmissionEvent`] per decision. Events flow through
//! [`TelemetrySink`] implementations, which are plain `tower::Service<AdmissionEvent>`s so they
//! compose with the rest of the tower ecosystem. Emission is best-effort: a failing sink never
//! changes an admission decision.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
