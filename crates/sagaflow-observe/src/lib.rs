//! Observability setup for Sagaflow: tracing subscriber and OpenTelemetry export.

pub mod tracing_setup;
