#![allow(clippy::doc_markdown)] // Allow technical terms like TTL, FSM in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resilience Core
//!
//! Resilience layer for outbound integrations: a circuit-breaker state
//! machine, a retry/backoff executor, and a layered fallback/offline
//! orchestration that together protect a system from cascading failures
//! when calling external services (metering APIs, billing providers, OCR
//! services, and the like).
//!
//! ## Architecture
//!
//! Components from leaf to root:
//!
//! - [`store`] - shared key-value store with per-key TTL holding breaker
//!   state, counters, cached payloads, and the pending sync queue
//! - [`breaker`] - open/closed/half-open decision engine per service name
//! - [`retry`] - bounded attempts with exponential backoff and jitter
//! - [`fallback`] - cache → caller fallback → offline stub → typed failure
//! - [`sync`] - cache-backed queue of deferred operations with bounded replay
//! - [`registry`] - append-only set of known service names for dashboards
//! - [`health`] - fire-and-forget success/failure/circuit-open recording
//! - [`orchestrator`] - the protected-call entry point composing the above
//! - [`config`] - per-service policies with global defaults
//!
//! State is per-process/per-store-backend; the crate does not replicate
//! breaker state with strong consistency, and queued operations are replayed
//! at-least-once with a bounded attempt count.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_core::config::ResilienceConfig;
//! use resilience_core::health::TracingHealthRecorder;
//! use resilience_core::orchestrator::{ProtectedCall, ResilienceOrchestrator};
//! use resilience_core::store::MemoryStateStore;
//! use resilience_core::OperationError;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStateStore::new());
//! let config = ResilienceConfig::load()?;
//! let orchestrator =
//!     ResilienceOrchestrator::new(store, &config, Arc::new(TracingHealthRecorder))?;
//!
//! let result = orchestrator
//!     .execute(
//!         ProtectedCall::new("billing_api").with_fallback_value(json!({"plan": "cached"})),
//!         || async {
//!             // Call the external service here.
//!             Ok::<_, OperationError>(json!({"plan": "pro"}))
//!         },
//!     )
//!     .await?;
//!
//! println!("resolved from {:?}: {}", result.source, result.payload);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod store;
pub mod sync;

pub use breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitState, RejectionReason, ServicePolicy,
};
pub use config::ResilienceConfig;
pub use error::{ErrorKind, OperationError, ResilienceError, Result};
pub use fallback::{CachedResult, Fallback, FallbackChain, Resolved, ResolutionSource};
pub use health::{HealthRecorder, NoopHealthRecorder, TracingHealthRecorder};
pub use orchestrator::{ProtectedCall, ResilienceOrchestrator};
pub use retry::{RetryExecutor, RetryPolicy};
pub use store::{MemoryStateStore, StateStore, StoreError};
pub use sync::{DrainReport, OfflineSyncQueue, PendingSyncItem, ReplayHandler};
