//! Integration tests for circuit breaker recovery timing and state invariants.

use resilience_core::config::{CircuitBreakerSettings, ServicePolicyConfig};
use resilience_core::{
    Admission, CircuitBreaker, CircuitState, MemoryStateStore, NoopHealthRecorder, OperationError,
};
use std::sync::Arc;
use std::time::Duration;

fn breaker(failure_threshold: u32, success_threshold: u32, timeout_secs: u64) -> CircuitBreaker {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let settings = CircuitBreakerSettings {
        enabled: true,
        default_policy: ServicePolicyConfig {
            failure_threshold,
            success_threshold,
            recovery_timeout_seconds: timeout_secs,
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
async fn rejected_before_recovery_timeout_admitted_after() {
    let breaker = breaker(1, 1, 1);
    breaker.on_failure("svc", &failure()).await.unwrap();

    // Well before the timeout: still rejected, no state change.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        breaker.admit("svc").await.unwrap(),
        Admission::Rejected { .. }
    ));
    assert_eq!(
        breaker.status("svc").await.unwrap().state,
        CircuitState::Open
    );

    // Past the timeout: admitted as a half-open probe.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(breaker.admit("svc").await.unwrap().is_admitted());
    assert_eq!(
        breaker.status("svc").await.unwrap().state,
        CircuitState::HalfOpen
    );
}

#[tokio::test]
async fn opened_at_is_set_only_while_open() {
    let breaker = breaker(1, 1, 1);

    // Closed: no timestamp.
    assert!(breaker.status("svc").await.unwrap().opened_at.is_none());

    // Open: timestamp present.
    breaker.on_failure("svc", &failure()).await.unwrap();
    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert!(status.opened_at.is_some());

    // Half-open: cleared.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    breaker.admit("svc").await.unwrap();
    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::HalfOpen);
    assert!(status.opened_at.is_none());

    // Closed again after a successful probe: still cleared.
    breaker.on_success("svc").await.unwrap();
    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert!(status.opened_at.is_none());
}

#[tokio::test]
async fn failure_count_zero_after_every_transition_to_closed() {
    let breaker = breaker(2, 1, 1);

    // Open the circuit, recover through half-open, close it.
    breaker.on_failure("svc", &failure()).await.unwrap();
    breaker.on_failure("svc", &failure()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    breaker.admit("svc").await.unwrap();
    breaker.on_success("svc").await.unwrap();

    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.success_count, 0);

    // Operator reset from open also lands on zeroed counters.
    breaker.on_failure("svc", &failure()).await.unwrap();
    breaker.on_failure("svc", &failure()).await.unwrap();
    breaker.reset("svc").await.unwrap();
    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);
}

#[tokio::test]
async fn half_open_failure_restarts_the_recovery_clock() {
    let breaker = breaker(1, 3, 1);
    breaker.on_failure("svc", &failure()).await.unwrap();
    let first_opened = breaker.status("svc").await.unwrap().opened_at.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(breaker.admit("svc").await.unwrap().is_admitted());

    // Probe fails: circuit reopens with a fresh timestamp.
    breaker.on_failure("svc", &failure()).await.unwrap();
    let status = breaker.status("svc").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);
    let reopened = status.opened_at.unwrap();
    assert!(reopened > first_opened);

    // The new open interval rejects again until its own timeout elapses.
    assert!(matches!(
        breaker.admit("svc").await.unwrap(),
        Admission::Rejected { .. }
    ));
}

#[tokio::test]
async fn status_has_no_observable_side_effects() {
    let breaker = breaker(1, 1, 60);
    breaker.on_failure("svc", &failure()).await.unwrap();

    // Polling status does not transition the breaker even if called often.
    for _ in 0..5 {
        let status = breaker.status("svc").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
    }
    assert!(matches!(
        breaker.admit("svc").await.unwrap(),
        Admission::Rejected { .. }
    ));
}
