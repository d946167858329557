//! # Structured Error Handling
//!
//! Error taxonomy for the resilience layer. Outcomes of protected calls are
//! classified into a closed set of [`ErrorKind`]s by the operation wrapper,
//! and the retry executor decides retryability from the kind alone rather
//! than inspecting backend-specific error types.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed classification of operation failures.
///
/// Connection, timeout, rate-limit, and server-side errors are transient and
/// eligible for retry. Client and validation errors are permanent and
/// propagate on first occurrence without consuming retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection could not be established or was dropped mid-flight.
    Connection,
    /// The call exceeded its per-attempt deadline.
    Timeout,
    /// The remote service throttled the caller (HTTP 429).
    RateLimited,
    /// The remote service failed internally (HTTP 500/502/503/504).
    ServerError,
    /// The request was rejected by the remote service (other 4xx).
    ClientError,
    /// The request never left the process because its payload was invalid.
    Validation,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
        )
    }

    /// Map an HTTP status code onto a kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            500 | 502 | 503 | 504 => ErrorKind::ServerError,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::ServerError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure produced by a wrapped external operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Classify a failed HTTP response by status code.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_http_status(status), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Terminal failures surfaced to callers of the resilience layer.
///
/// Each variant identifies which layer gave up, so upstream code can decide
/// on user messaging without inspecting internals.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// Admission was rejected because the breaker is open and the recovery
    /// timeout has not elapsed.
    #[error("circuit breaker is open for {service}")]
    CircuitOpen {
        service: String,
        open_since: Option<DateTime<Utc>>,
    },

    /// The wrapped operation failed with a non-retryable error.
    #[error("operation against {service} failed")]
    OperationFailed {
        service: String,
        #[source]
        source: OperationError,
    },

    /// All retry attempts failed.
    #[error("retries exhausted for {service} after {attempts} attempts")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        #[source]
        last: OperationError,
    },

    /// No cached result, no caller fallback, and offline mode disallowed.
    #[error("no fallback available for {service} (circuit_open: {circuit_open})")]
    NoFallbackAvailable { service: String, circuit_open: bool },

    /// A caller explicitly asked to act against a service whose breaker is open.
    #[error("service {service} is unavailable")]
    ServiceUnavailable { service: String },

    #[error("state store error")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ResilienceError {
    /// The last classified operation error carried by this failure, if any.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            ResilienceError::OperationFailed { source, .. } => Some(source),
            ResilienceError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Whether this failure was a breaker rejection rather than a real call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
