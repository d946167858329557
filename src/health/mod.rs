//! # Health Event Recording
//!
//! Collaborator seam for observability dashboards. The resilience layer
//! reports success latency, classified failures, and circuit-open events
//! through [`HealthRecorder`]; recording is fire-and-forget and must never
//! block or fail the primary call path, so the trait is infallible and
//! synchronous.

use crate::error::ErrorKind;
use std::fmt;
use tracing::{debug, warn};

/// Consumes success/failure/circuit-open events for monitoring.
pub trait HealthRecorder: Send + Sync + fmt::Debug {
    /// A protected call completed successfully.
    fn record_success(&self, service_name: &str, latency_ms: u64);

    /// A protected call failed terminally (after retries, if any).
    fn record_failure(&self, service_name: &str, error_class: ErrorKind, message: &str);

    /// The breaker for a service transitioned to open.
    fn record_circuit_open(&self, service_name: &str);
}

/// Recorder that emits structured tracing events.
#[derive(Debug, Default)]
pub struct TracingHealthRecorder;

impl HealthRecorder for TracingHealthRecorder {
    fn record_success(&self, service_name: &str, latency_ms: u64) {
        debug!(
            service = %service_name,
            response_time_ms = latency_ms,
            "Service operation successful"
        );
    }

    fn record_failure(&self, service_name: &str, error_class: ErrorKind, message: &str) {
        warn!(
            service = %service_name,
            error_class = %error_class,
            error = %message,
            "Service operation failed"
        );
    }

    fn record_circuit_open(&self, service_name: &str) {
        warn!(service = %service_name, "Circuit breaker opened");
    }
}

/// Recorder that discards all events. Useful in tests and in deployments
/// without a dashboard consumer.
#[derive(Debug, Default)]
pub struct NoopHealthRecorder;

impl HealthRecorder for NoopHealthRecorder {
    fn record_success(&self, _service_name: &str, _latency_ms: u64) {}

    fn record_failure(&self, _service_name: &str, _error_class: ErrorKind, _message: &str) {}

    fn record_circuit_open(&self, _service_name: &str) {}
}
