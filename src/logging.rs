//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and
//! files for debugging protected-call flows across services.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        if !log_dir.exists() {
            if let Err(e) = fs::create_dir_all(&log_dir) {
                eprintln!("Failed to create log directory: {e}");
                return;
            }
        }

        // Log file name carries environment, PID, and timestamp so
        // concurrent processes never clobber each other.
        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        // A global subscriber may already be set by the embedding
        // application; that is not an error.
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            "Structured logging initialized with file output"
        );

        // Keep the non-blocking writer alive for the process lifetime.
        std::mem::forget(guard);
    });
}

/// Current environment from environment variables.
fn get_environment() -> String {
    std::env::var("RESILIENCE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Log level for an environment.
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a completed protected call.
pub fn log_protected_call(
    service: &str,
    outcome: &str,
    source: Option<&str>,
    latency_ms: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        service = %service,
        outcome = %outcome,
        source = source,
        latency_ms = latency_ms,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "PROTECTED_CALL"
    );
}

/// Log structured data for offline sync operations.
pub fn log_sync_operation(
    service: &str,
    operation: &str,
    synchronized: u32,
    failed: u32,
    dead_lettered: u32,
) {
    tracing::info!(
        service = %service,
        operation = %operation,
        synchronized = synchronized,
        failed = failed,
        dead_lettered = dead_lettered,
        timestamp = %Utc::now().to_rfc3339(),
        "SYNC_OPERATION"
    );
}
