//! # Configuration Management
//!
//! Serde-backed configuration for the resilience layer: a global default
//! policy per concern plus named per-service overrides, loaded from an
//! optional YAML/TOML file layered with `RESILIENCE_`-prefixed environment
//! variables.
//!
//! Policies are resolved once per decision via
//! [`CircuitBreakerSettings::policy_for_service`] and never mutated after
//! resolution.

use crate::breaker::ServicePolicy;
use crate::error::ResilienceError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the resilience layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breakers: CircuitBreakerSettings,
    pub retry: RetryPolicyConfig,
    pub offline_sync: OfflineSyncConfig,
}

impl ResilienceConfig {
    /// Load configuration from an explicit file, layered with environment
    /// variables (`RESILIENCE_RETRY__MAX_ATTEMPTS=5` style overrides).
    pub fn from_file(path: &Path) -> Result<Self, ResilienceError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("RESILIENCE").separator("__"))
            .build()
            .map_err(|e| ResilienceError::Configuration(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| ResilienceError::Configuration(e.to_string()))
    }

    /// Load configuration from the path named by `RESILIENCE_CONFIG_PATH`,
    /// falling back to built-in defaults when unset.
    pub fn load() -> Result<Self, ResilienceError> {
        match std::env::var("RESILIENCE_CONFIG_PATH") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Circuit breaker settings: one default policy plus per-service overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Whether breakers reject at all; disabled breakers admit everything.
    pub enabled: bool,

    /// Policy applied when a service has no specific override.
    pub default_policy: ServicePolicyConfig,

    /// Per-service policy overrides, keyed by service name.
    pub service_policies: HashMap<String, ServicePolicyConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_policy: ServicePolicyConfig::default(),
            service_policies: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Resolve the effective policy for a service.
    pub fn policy_for_service(&self, service_name: &str) -> ServicePolicy {
        self.service_policies
            .get(service_name)
            .unwrap_or(&self.default_policy)
            .to_policy()
    }
}

/// Per-service breaker policy as written in config files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServicePolicyConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Successes required in half-open state before the circuit closes.
    pub success_threshold: u32,

    /// Seconds to hold the circuit open before admitting a probe.
    pub recovery_timeout_seconds: u64,

    /// Minutes a cached last-known-good payload stays usable as a fallback.
    pub cache_ttl_minutes: u64,
}

impl Default for ServicePolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_seconds: 60,
            cache_ttl_minutes: 60,
        }
    }
}

impl ServicePolicyConfig {
    /// Convert to the breaker module's resolved policy type.
    pub fn to_policy(&self) -> ServicePolicy {
        ServicePolicy {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
            cache_ttl: Duration::from_secs(self.cache_ttl_minutes * 60),
        }
    }
}

/// Retry policy as written in config files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as uniform random jitter, in [0, 1).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicyConfig {
    /// Convert to the retry module's validated policy type.
    pub fn to_policy(&self) -> Result<RetryPolicy, ResilienceError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
            self.jitter_fraction,
        )
    }
}

/// Offline sync queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OfflineSyncConfig {
    /// Replay attempts before an item is dead-lettered.
    pub max_replay_attempts: u32,

    /// Minutes a pending item survives in the store before expiring.
    pub item_ttl_minutes: u64,
}

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            max_replay_attempts: 3,
            item_ttl_minutes: 24 * 60,
        }
    }
}

impl OfflineSyncConfig {
    pub fn item_ttl(&self) -> Duration {
        Duration::from_secs(self.item_ttl_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_defaults() {
        let settings = CircuitBreakerSettings::default();
        let policy = settings.policy_for_service("anything");
        assert_eq!(policy.failure_threshold, 5);
        assert_eq!(policy.success_threshold, 3);
        assert_eq!(policy.recovery_timeout, Duration::from_secs(60));
        assert_eq!(policy.cache_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn service_override_wins_over_default() {
        let mut settings = CircuitBreakerSettings::default();
        settings.service_policies.insert(
            "ocr_service".to_string(),
            ServicePolicyConfig {
                failure_threshold: 2,
                recovery_timeout_seconds: 30,
                ..ServicePolicyConfig::default()
            },
        );

        let policy = settings.policy_for_service("ocr_service");
        assert_eq!(policy.failure_threshold, 2);
        assert_eq!(policy.recovery_timeout, Duration::from_secs(30));

        let other = settings.policy_for_service("billing_api");
        assert_eq!(other.failure_threshold, 5);
    }

    #[test]
    fn config_file_roundtrip() {
        let config = ResilienceConfig::default();
        let yaml = serde_json::to_string(&config).unwrap();
        let parsed: ResilienceConfig = serde_json::from_str(&yaml).unwrap();
        assert_eq!(parsed.retry.max_attempts, config.retry.max_attempts);
        assert_eq!(parsed.offline_sync.max_replay_attempts, 3);
    }

    #[test]
    fn from_file_reads_yaml() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "retry:\n  max_attempts: 7\ncircuit_breakers:\n  default_policy:\n    failure_threshold: 9"
        )
        .unwrap();

        let config = ResilienceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.circuit_breakers.default_policy.failure_threshold, 9);
        // Unspecified fields keep defaults.
        assert_eq!(config.circuit_breakers.default_policy.success_threshold, 3);
    }
}
