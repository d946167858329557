//! # Circuit Breaker
//!
//! Decision engine implementing the open/closed/half-open state machine for
//! named services. All state lives in the shared [`StateStore`] under the
//! `breaker:{service}:*` key namespace, so concurrent callers across the
//! process observe the same circuit.
//!
//! There is no background timer: the `Open → HalfOpen` transition is
//! evaluated lazily at admission time. Two callers may both observe the
//! recovery timeout elapsed and both be admitted as probes; this thundering
//! probe risk is accepted and bounded by `success_threshold` requiring
//! repeated confirmation before the circuit closes.
//!
//! Counter updates use the store's atomic increment, and every
//! read-modify-write sequence is additionally guarded by a per-service-name
//! mutex. A naive read-then-write is never performed.

use crate::config::CircuitBreakerSettings;
use crate::error::{OperationError, Result};
use crate::health::HealthRecorder;
use crate::registry::ServiceRegistry;
use crate::store::StateStore;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls are admitted.
    Closed,
    /// Failing fast, calls are rejected without reaching the service.
    Open,
    /// Testing recovery, probe calls are admitted.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("open") => CircuitState::Open,
            Some("half_open") => CircuitState::HalfOpen,
            // Absent state reads as closed: reset deletes the key.
            _ => CircuitState::Closed,
        }
    }
}

/// Resolved, immutable per-service breaker policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePolicy {
    /// Failures in closed state before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in half-open state before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
    /// TTL for last-known-good payloads cached for fallback use.
    pub cache_ttl: Duration,
}

/// Read-only snapshot of a service's breaker state for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Why an admission request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The circuit is open and the recovery timeout has not elapsed.
    CircuitOpen,
    /// An operator placed the service in maintenance mode.
    Maintenance,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Admitted,
    /// The call must not be attempted.
    Rejected {
        reason: RejectionReason,
        open_since: Option<DateTime<Utc>>,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

fn state_key(service: &str) -> String {
    format!("breaker:{service}:state")
}

fn failures_key(service: &str) -> String {
    format!("breaker:{service}:failures")
}

fn successes_key(service: &str) -> String {
    format!("breaker:{service}:successes")
}

fn opened_at_key(service: &str) -> String {
    format!("breaker:{service}:opened_at")
}

fn maintenance_key(service: &str) -> String {
    format!("breaker:{service}:maintenance")
}

/// Circuit breaker over the shared state store.
#[derive(Debug)]
pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    settings: CircuitBreakerSettings,
    registry: ServiceRegistry,
    health: Arc<dyn HealthRecorder>,

    /// Per-service-name locks guarding read-modify-write sequences.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn StateStore>,
        settings: CircuitBreakerSettings,
        health: Arc<dyn HealthRecorder>,
    ) -> Self {
        info!(
            enabled = settings.enabled,
            failure_threshold = settings.default_policy.failure_threshold,
            success_threshold = settings.default_policy.success_threshold,
            recovery_timeout_seconds = settings.default_policy.recovery_timeout_seconds,
            "🛡️ Circuit breaker initialized"
        );

        let registry = ServiceRegistry::new(Arc::clone(&store));
        Self {
            store,
            settings,
            registry,
            health,
            locks: DashMap::new(),
        }
    }

    /// Effective policy for a service (override or global default).
    pub fn policy_for(&self, service_name: &str) -> ServicePolicy {
        self.settings.policy_for_service(service_name)
    }

    fn lock_for(&self, service_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ask whether a call against the service may proceed.
    ///
    /// Never mutates failure or success counters. May transition
    /// `Open → HalfOpen` as a side effect of evaluating the recovery timeout.
    pub async fn admit(&self, service_name: &str) -> Result<Admission> {
        self.registry.register(service_name).await?;

        if !self.settings.enabled {
            return Ok(Admission::Admitted);
        }

        if self.in_maintenance(service_name).await? {
            debug!(service = %service_name, "Call rejected, service in maintenance mode");
            return Ok(Admission::Rejected {
                reason: RejectionReason::Maintenance,
                open_since: None,
            });
        }

        let lock = self.lock_for(service_name);
        let _guard = lock.lock().await;

        match self.read_state(service_name).await? {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(Admission::Admitted),
            CircuitState::Open => {
                let opened_at = self.read_opened_at(service_name).await?;
                let policy = self.policy_for(service_name);

                let elapsed = opened_at
                    .map(|t| Utc::now().signed_duration_since(t))
                    .and_then(|d| d.to_std().ok());

                match (opened_at, elapsed) {
                    (Some(_), Some(elapsed)) if elapsed >= policy.recovery_timeout => {
                        self.transition_to_half_open(service_name).await?;
                        Ok(Admission::Admitted)
                    }
                    (Some(opened_at), _) => {
                        debug!(
                            service = %service_name,
                            open_since = %opened_at,
                            "Circuit breaker is open, request blocked"
                        );
                        Ok(Admission::Rejected {
                            reason: RejectionReason::CircuitOpen,
                            open_since: Some(opened_at),
                        })
                    }
                    (None, _) => {
                        // Open without a timestamp should not happen; admit
                        // rather than wedging the service shut.
                        warn!(service = %service_name, "Circuit open but no opened_at recorded");
                        self.transition_to_half_open(service_name).await?;
                        Ok(Admission::Admitted)
                    }
                }
            }
        }
    }

    /// Report a successful call against the service.
    pub async fn on_success(&self, service_name: &str) -> Result<()> {
        let lock = self.lock_for(service_name);
        let _guard = lock.lock().await;

        match self.read_state(service_name).await? {
            CircuitState::Closed => {
                self.store.delete(&failures_key(service_name)).await?;
                Ok(())
            }
            CircuitState::HalfOpen => {
                let policy = self.policy_for(service_name);
                let successes = self
                    .store
                    .increment(&successes_key(service_name), Some(policy.recovery_timeout))
                    .await?;

                if successes >= i64::from(policy.success_threshold) {
                    self.transition_to_closed(service_name).await?;
                }
                Ok(())
            }
            // Should not occur given admit semantics, but must not fail.
            CircuitState::Open => {
                warn!(service = %service_name, "Success recorded while circuit is open");
                Ok(())
            }
        }
    }

    /// Report a failed call against the service.
    pub async fn on_failure(&self, service_name: &str, error: &OperationError) -> Result<()> {
        let lock = self.lock_for(service_name);
        let _guard = lock.lock().await;

        match self.read_state(service_name).await? {
            CircuitState::Closed => {
                let policy = self.policy_for(service_name);
                // Failure counts are windowed by the recovery timeout, so a
                // trickle of old failures does not eventually open the circuit.
                let failures = self
                    .store
                    .increment(&failures_key(service_name), Some(policy.recovery_timeout))
                    .await?;

                warn!(
                    service = %service_name,
                    failure_count = failures,
                    failure_threshold = policy.failure_threshold,
                    error_class = %error.kind,
                    "Circuit breaker recorded failure"
                );

                if failures >= i64::from(policy.failure_threshold) {
                    self.transition_to_open(service_name).await?;
                }
                Ok(())
            }
            // A single failure while probing reopens regardless of threshold.
            CircuitState::HalfOpen => {
                warn!(
                    service = %service_name,
                    error_class = %error.kind,
                    "Probe failed in half-open state, reopening circuit"
                );
                self.transition_to_open(service_name).await
            }
            CircuitState::Open => Ok(()),
        }
    }

    /// Operator intervention: force the circuit to closed with zeroed counters.
    pub async fn reset(&self, service_name: &str) -> Result<()> {
        let lock = self.lock_for(service_name);
        let _guard = lock.lock().await;

        self.clear_state(service_name).await?;
        info!(service = %service_name, "Circuit breaker reset to closed state");
        Ok(())
    }

    /// Read-only snapshot for one service. No observable side effects.
    pub async fn status(&self, service_name: &str) -> Result<BreakerSnapshot> {
        let state = self.read_state(service_name).await?;
        let failure_count = self.read_counter(&failures_key(service_name)).await?;
        let success_count = self.read_counter(&successes_key(service_name)).await?;
        let opened_at = self.read_opened_at(service_name).await?;

        Ok(BreakerSnapshot {
            service_name: service_name.to_string(),
            state,
            failure_count,
            success_count,
            opened_at,
        })
    }

    /// Snapshots for every registered service.
    pub async fn status_all(&self) -> Result<Vec<BreakerSnapshot>> {
        let mut snapshots = Vec::new();
        for service in self.registry.services().await? {
            snapshots.push(self.status(&service).await?);
        }
        Ok(snapshots)
    }

    /// Reject all calls against the service for the given duration.
    pub async fn enable_maintenance_mode(
        &self,
        service_name: &str,
        duration: Duration,
    ) -> Result<()> {
        self.store
            .put(&maintenance_key(service_name), json!(true), Some(duration))
            .await?;
        info!(
            service = %service_name,
            duration_minutes = duration.as_secs() / 60,
            "Maintenance mode enabled"
        );
        Ok(())
    }

    pub async fn in_maintenance(&self, service_name: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&maintenance_key(service_name))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn read_state(&self, service_name: &str) -> Result<CircuitState> {
        let stored = self.store.get(&state_key(service_name)).await?;
        Ok(CircuitState::from_stored(
            stored.as_ref().and_then(|v| v.as_str()),
        ))
    }

    async fn read_counter(&self, key: &str) -> Result<u32> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.as_i64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0))
    }

    async fn read_opened_at(&self, service_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(&opened_at_key(service_name))
            .await?
            .and_then(|v| v.as_i64())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    async fn transition_to_open(&self, service_name: &str) -> Result<()> {
        let opened_at = Utc::now();
        self.store
            .put(&state_key(service_name), json!("open"), None)
            .await?;
        self.store
            .put(
                &opened_at_key(service_name),
                json!(opened_at.timestamp_millis()),
                None,
            )
            .await?;
        // Counters reset on every transition into open.
        self.store.delete(&failures_key(service_name)).await?;
        self.store.delete(&successes_key(service_name)).await?;

        warn!(
            service = %service_name,
            opened_at = %opened_at,
            "🔴 Circuit breaker opened (failing fast)"
        );
        self.health.record_circuit_open(service_name);
        Ok(())
    }

    async fn transition_to_half_open(&self, service_name: &str) -> Result<()> {
        self.store
            .put(&state_key(service_name), json!("half_open"), None)
            .await?;
        // opened_at is only meaningful while open.
        self.store.delete(&opened_at_key(service_name)).await?;
        self.store.delete(&successes_key(service_name)).await?;

        info!(service = %service_name, "🟡 Circuit breaker half-open (testing recovery)");
        Ok(())
    }

    async fn transition_to_closed(&self, service_name: &str) -> Result<()> {
        self.clear_state(service_name).await?;
        info!(service = %service_name, "🟢 Circuit breaker closed (recovered)");
        Ok(())
    }

    async fn clear_state(&self, service_name: &str) -> Result<()> {
        self.store.delete(&state_key(service_name)).await?;
        self.store.delete(&failures_key(service_name)).await?;
        self.store.delete(&successes_key(service_name)).await?;
        self.store.delete(&opened_at_key(service_name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicePolicyConfig;
    use crate::health::NoopHealthRecorder;
    use crate::store::MemoryStateStore;

    fn test_breaker(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> CircuitBreaker {
        let settings = CircuitBreakerSettings {
            enabled: true,
            default_policy: ServicePolicyConfig {
                failure_threshold,
                success_threshold,
                recovery_timeout_seconds: timeout.as_secs().max(1),
                cache_ttl_minutes: 60,
            },
            service_policies: Default::default(),
        };
        CircuitBreaker::new(
            Arc::new(MemoryStateStore::new()),
            settings,
            Arc::new(NoopHealthRecorder),
        )
    }

    fn failure() -> OperationError {
        OperationError::connection("connection refused")
    }

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let breaker = test_breaker(3, 2, Duration::from_secs(60));
        assert!(breaker.admit("svc").await.unwrap().is_admitted());

        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.opened_at.is_none());
    }

    #[tokio::test]
    async fn opens_at_exactly_the_failure_threshold() {
        let breaker = test_breaker(3, 2, Duration::from_secs(60));

        breaker.on_failure("svc", &failure()).await.unwrap();
        breaker.on_failure("svc", &failure()).await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::Closed);

        breaker.on_failure("svc", &failure()).await.unwrap();
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.opened_at.is_some());
        // Counters reset on the transition into open.
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn open_circuit_rejects_until_timeout() {
        let breaker = test_breaker(1, 1, Duration::from_secs(60));
        breaker.on_failure("svc", &failure()).await.unwrap();

        match breaker.admit("svc").await.unwrap() {
            Admission::Rejected { reason, open_since } => {
                assert_eq!(reason, RejectionReason::CircuitOpen);
                assert!(open_since.is_some());
            }
            Admission::Admitted => panic!("open circuit must reject"),
        }
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let breaker = test_breaker(3, 2, Duration::from_secs(60));

        breaker.on_failure("svc", &failure()).await.unwrap();
        breaker.on_failure("svc", &failure()).await.unwrap();
        breaker.on_success("svc").await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().failure_count, 0);

        // Two more failures stay below the threshold after the reset.
        breaker.on_failure("svc", &failure()).await.unwrap();
        breaker.on_failure("svc", &failure()).await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open_probes() {
        let breaker = test_breaker(1, 2, Duration::from_secs(1));
        breaker.on_failure("svc", &failure()).await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(breaker.admit("svc").await.unwrap().is_admitted());
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert!(status.opened_at.is_none());

        breaker.on_success("svc").await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::HalfOpen);

        breaker.on_success("svc").await.unwrap();
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test]
    async fn single_half_open_failure_reopens() {
        let breaker = test_breaker(1, 5, Duration::from_secs(1));
        breaker.on_failure("svc", &failure()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(breaker.admit("svc").await.unwrap().is_admitted());

        // Several successes, but still below the threshold of 5.
        breaker.on_success("svc").await.unwrap();
        breaker.on_success("svc").await.unwrap();

        breaker.on_failure("svc", &failure()).await.unwrap();
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.opened_at.is_some());
    }

    #[tokio::test]
    async fn success_while_open_is_a_noop() {
        let breaker = test_breaker(1, 1, Duration::from_secs(60));
        breaker.on_failure("svc", &failure()).await.unwrap();

        breaker.on_success("svc").await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_force_closes() {
        let breaker = test_breaker(1, 1, Duration::from_secs(60));
        breaker.on_failure("svc", &failure()).await.unwrap();
        assert_eq!(breaker.status("svc").await.unwrap().state, CircuitState::Open);

        breaker.reset("svc").await.unwrap();
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
        assert!(status.opened_at.is_none());
        assert!(breaker.admit("svc").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn maintenance_mode_rejects_and_expires() {
        let breaker = test_breaker(5, 3, Duration::from_secs(60));
        breaker
            .enable_maintenance_mode("svc", Duration::from_millis(50))
            .await
            .unwrap();

        match breaker.admit("svc").await.unwrap() {
            Admission::Rejected { reason, .. } => {
                assert_eq!(reason, RejectionReason::Maintenance);
            }
            Admission::Admitted => panic!("maintenance must reject"),
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.admit("svc").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn status_all_lists_registered_services() {
        let breaker = test_breaker(5, 3, Duration::from_secs(60));
        breaker.admit("billing_api").await.unwrap();
        breaker.admit("meter_api").await.unwrap();

        let snapshots = breaker.status_all().await.unwrap();
        let names: Vec<_> = snapshots.iter().map(|s| s.service_name.as_str()).collect();
        assert_eq!(names, vec!["billing_api", "meter_api"]);
    }

    #[tokio::test]
    async fn disabled_breaker_admits_everything() {
        let mut settings = CircuitBreakerSettings::default();
        settings.enabled = false;
        let breaker = CircuitBreaker::new(
            Arc::new(MemoryStateStore::new()),
            settings,
            Arc::new(NoopHealthRecorder),
        );

        for _ in 0..10 {
            breaker.on_failure("svc", &failure()).await.unwrap();
        }
        assert!(breaker.admit("svc").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn circuit_open_event_reaches_the_health_recorder() {
        use crate::health::test_support::CapturingHealthRecorder;

        let recorder = Arc::new(CapturingHealthRecorder::default());
        let settings = CircuitBreakerSettings {
            enabled: true,
            default_policy: ServicePolicyConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout_seconds: 60,
                cache_ttl_minutes: 60,
            },
            service_policies: Default::default(),
        };
        let breaker = CircuitBreaker::new(
            Arc::new(MemoryStateStore::new()),
            settings,
            Arc::clone(&recorder) as Arc<dyn HealthRecorder>,
        );

        breaker.on_failure("svc", &failure()).await.unwrap();
        assert!(recorder.circuit_opens.lock().is_empty());

        breaker.on_failure("svc", &failure()).await.unwrap();
        assert_eq!(*recorder.circuit_opens.lock(), vec!["svc".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_failures_open_exactly_once() {
        let breaker = Arc::new(test_breaker(10, 1, Duration::from_secs(60)));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    breaker.on_failure("svc", &failure()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20 concurrent failures against a threshold of 10: the circuit is
        // open and its counters were reset by the transition.
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.opened_at.is_some());
    }
}
