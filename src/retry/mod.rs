//! # Retry Executor
//!
//! Bounded-attempt execution with exponential backoff and uniform jitter.
//! Retryability is decided purely from the classified [`ErrorKind`] of each
//! failure; non-retryable errors propagate on first occurrence without
//! consuming retry budget.
//!
//! Jitter exists to avoid synchronized retry storms across many concurrent
//! callers of the same failing service.

use crate::error::{OperationError, ResilienceError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Immutable retry policy value object.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// Build a validated policy.
    ///
    /// Rejects `max_attempts = 0`, a zero base delay, `multiplier < 1`, and
    /// a jitter fraction outside `[0, 1)`.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ResilienceError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if base_delay.is_zero() {
            return Err(ResilienceError::Configuration(
                "retry base_delay must be positive".to_string(),
            ));
        }
        if multiplier < 1.0 {
            return Err(ResilienceError::Configuration(
                "retry multiplier must be >= 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&jitter_fraction) {
            return Err(ResilienceError::Configuration(
                "retry jitter_fraction must be in [0, 1)".to_string(),
            ));
        }

        Ok(Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
            jitter_fraction,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Exponential delay before the next try after `attempt` (1-based),
    /// before jitter: `min(max_delay, base × multiplier^(attempt−1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The delay actually slept: exponential delay plus uniform jitter in
    /// `[0, delay × jitter_fraction)`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_fraction == 0.0 || delay.is_zero() {
            return delay;
        }

        let span = delay.as_millis() as f64 * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(0.0..span);
        delay + Duration::from_millis(jitter as u64)
    }

    /// Upper bound on total backoff sleep across a full execution. Exposed so
    /// callers can bound worst-case request latency when composing with
    /// per-attempt timeouts.
    pub fn worst_case_delay(&self) -> Duration {
        let jitter_factor = 1.0 + self.jitter_fraction;
        (1..self.max_attempts).fold(Duration::ZERO, |total, attempt| {
            total + self.delay_for_attempt(attempt).mul_f64(jitter_factor)
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter_fraction: 0.2,
        }
    }
}

/// Executes operations under a [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` for up to `policy.max_attempts()` attempts.
    ///
    /// Returns the first success, raises [`ResilienceError::OperationFailed`]
    /// immediately on a non-retryable error, and
    /// [`ResilienceError::RetriesExhausted`] when the attempt budget runs out.
    pub async fn execute<T, F, Fut>(
        &self,
        service_name: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        let mut last_error: Option<OperationError> = None;

        for attempt in 1..=policy.max_attempts() {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    return Err(ResilienceError::OperationFailed {
                        service: service_name.to_string(),
                        source: error,
                    });
                }
                Err(error) => {
                    if attempt < policy.max_attempts() {
                        let delay = policy.jittered_delay(attempt);
                        debug!(
                            service = %service_name,
                            attempt,
                            max_attempts = policy.max_attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error_class = %error.kind,
                            "Retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        // max_attempts >= 1 guarantees at least one recorded error here.
        let last = last_error.unwrap_or_else(|| {
            OperationError::connection("retry budget exhausted with no recorded error")
        });
        Err(ResilienceError::RetriesExhausted {
            service: service_name.to_string(),
            attempts: policy.max_attempts(),
            last,
        })
    }
}
