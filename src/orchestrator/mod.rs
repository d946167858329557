//! # Resilience Orchestrator
//!
//! Top-level entry point for a single protected call. Composes the circuit
//! breaker, retry executor, fallback chain, health recorder, and offline
//! sync queue: admission is checked first, admitted calls run under the
//! retry policy, outcomes feed back into the breaker and health recorder,
//! and failures resolve through the fallback chain.
//!
//! Everything runs inline on the caller's task. The only suspension beyond
//! the wrapped call itself is the retry backoff sleep; per-attempt timeouts
//! are the wrapped operation's responsibility.

use crate::breaker::{Admission, CircuitBreaker, RejectionReason};
use crate::config::ResilienceConfig;
use crate::error::{OperationError, ResilienceError, Result};
use crate::fallback::{Fallback, FallbackChain, Resolved};
use crate::health::HealthRecorder;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::StateStore;
use crate::sync::{DrainReport, OfflineSyncQueue, ReplayHandler};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Description of one protected call against a named service.
#[derive(Debug)]
pub struct ProtectedCall {
    service_name: String,
    retry_policy: Option<RetryPolicy>,
    fallback: Option<Fallback>,
    allow_offline: bool,
    defer: Option<(String, Value)>,
}

impl ProtectedCall {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            retry_policy: None,
            fallback: None,
            allow_offline: true,
            defer: None,
        }
    }

    /// Override the orchestrator's default retry policy for this call.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Supply a ready fallback value.
    pub fn with_fallback_value(mut self, value: Value) -> Self {
        self.fallback = Some(Fallback::value(value));
        self
    }

    /// Supply a fallback handler invoked with the triggering error.
    pub fn with_fallback_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ResilienceError) -> Value + Send + Sync + 'static,
    {
        self.fallback = Some(Fallback::handler(handler));
        self
    }

    /// Fail with a typed error instead of returning the offline stub when no
    /// other fallback resolves.
    pub fn disallow_offline(mut self) -> Self {
        self.allow_offline = false;
        self
    }

    /// Queue the named operation for offline replay if the call cannot
    /// complete against the live service.
    pub fn defer_as(mut self, operation: impl Into<String>, payload: Value) -> Self {
        self.defer = Some((operation.into(), payload));
        self
    }
}

/// Composes breaker, retry, fallback, health recording, and offline
/// deferral for protected calls.
#[derive(Debug)]
pub struct ResilienceOrchestrator {
    breaker: Arc<CircuitBreaker>,
    executor: RetryExecutor,
    fallbacks: FallbackChain,
    health: Arc<dyn HealthRecorder>,
    sync_queue: Arc<OfflineSyncQueue>,
    default_retry: RetryPolicy,
}

impl ResilienceOrchestrator {
    /// Wire the full resilience stack over one shared state store.
    pub fn new(
        store: Arc<dyn StateStore>,
        config: &ResilienceConfig,
        health: Arc<dyn HealthRecorder>,
    ) -> Result<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::clone(&store),
            config.circuit_breakers.clone(),
            Arc::clone(&health),
        ));
        let sync_queue = Arc::new(OfflineSyncQueue::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            config.offline_sync.clone(),
        ));

        Ok(Self {
            breaker,
            executor: RetryExecutor::new(),
            fallbacks: FallbackChain::new(store),
            health,
            sync_queue,
            default_retry: config.retry.to_policy()?,
        })
    }

    /// The breaker, for operator controls (`reset`, `status`, `status_all`,
    /// `enable_maintenance_mode`) and direct admission checks.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The offline queue, for explicit deferral and replay.
    pub fn sync_queue(&self) -> &Arc<OfflineSyncQueue> {
        &self.sync_queue
    }

    /// Execute a protected call.
    ///
    /// Returns the operation's own payload on success (tagged `Primary`), a
    /// degraded result from the fallback chain when the call cannot
    /// complete, or a typed error when nothing resolves. Non-retryable
    /// failures propagate as [`ResilienceError::OperationFailed`] without
    /// consulting the fallback chain.
    pub async fn execute<F, Fut>(&self, call: ProtectedCall, operation: F) -> Result<Resolved>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Value, OperationError>>,
    {
        let service = call.service_name.clone();

        match self.breaker.admit(&service).await? {
            Admission::Admitted => {}
            Admission::Rejected { reason, open_since } => {
                let cause = match reason {
                    RejectionReason::CircuitOpen => {
                        warn!(service = %service, "Circuit breaker open, skipping call");
                        ResilienceError::CircuitOpen {
                            service: service.clone(),
                            open_since,
                        }
                    }
                    RejectionReason::Maintenance => {
                        warn!(service = %service, "Service in maintenance mode, skipping call");
                        ResilienceError::ServiceUnavailable {
                            service: service.clone(),
                        }
                    }
                };
                return self.resolve_failure(call, cause).await;
            }
        }

        let policy = call.retry_policy.clone().unwrap_or_else(|| self.default_retry.clone());
        let started = Instant::now();

        match self.executor.execute(&service, &policy, operation).await {
            Ok(payload) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.breaker.on_success(&service).await?;
                self.health.record_success(&service, latency_ms);

                let cache_ttl = self.breaker.policy_for(&service).cache_ttl;
                self.fallbacks
                    .cache_result(&service, payload.clone(), cache_ttl)
                    .await?;

                crate::logging::log_protected_call(
                    &service,
                    "success",
                    Some("primary"),
                    Some(latency_ms),
                    None,
                );
                Ok(Resolved::primary(payload))
            }
            Err(cause) => {
                if let Some(op_error) = cause.operation_error() {
                    self.breaker.on_failure(&service, op_error).await?;
                    self.health
                        .record_failure(&service, op_error.kind, &op_error.message);
                }
                // Non-retryable failures surface to the caller unchanged;
                // the fallback chain serves rejected admissions and
                // exhausted retries.
                if matches!(cause, ResilienceError::OperationFailed { .. }) {
                    error!(
                        service = %service,
                        error = %cause,
                        "Protected call failed with a permanent error"
                    );
                    return Err(cause);
                }
                self.resolve_failure(call, cause).await
            }
        }
    }

    /// Drain the offline queue for a service through the given handler.
    pub async fn synchronize(
        &self,
        service_name: &str,
        handler: &dyn ReplayHandler,
    ) -> Result<DrainReport> {
        self.sync_queue.drain(service_name, handler).await
    }

    /// Drain the offline queues of every registered service, skipping those
    /// whose breaker rejects admission.
    pub async fn synchronize_all(&self, handler: &dyn ReplayHandler) -> Result<DrainReport> {
        self.sync_queue.drain_all(handler).await
    }

    async fn resolve_failure(&self, call: ProtectedCall, cause: ResilienceError) -> Result<Resolved> {
        let service = call.service_name;

        // The operation never completed remotely; queue the deferred replay
        // descriptor regardless of how (or whether) the fallback resolves.
        if let Some((operation, payload)) = call.defer {
            self.sync_queue
                .enqueue(&service, &operation, payload)
                .await?;
        }

        let status = self.breaker.status(&service).await?;
        error!(
            service = %service,
            error = %cause,
            error_class = cause.operation_error().map(|e| e.kind.as_str()),
            breaker_state = status.state.as_str(),
            failure_count = status.failure_count,
            "Protected call failed, consulting fallback chain"
        );

        let resolved = self
            .fallbacks
            .resolve(&service, &cause, call.fallback.as_ref(), call.allow_offline)
            .await?;

        crate::logging::log_protected_call(
            &service,
            "degraded",
            Some(match resolved.source {
                crate::fallback::ResolutionSource::Cache => "cache",
                crate::fallback::ResolutionSource::CallerFallback => "caller_fallback",
                crate::fallback::ResolutionSource::OfflineStub => "offline_stub",
                crate::fallback::ResolutionSource::Primary => "primary",
            }),
            None,
            Some(&cause.to_string()),
        );
        Ok(resolved)
    }
}
