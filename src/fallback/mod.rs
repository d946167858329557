//! # Fallback Chain
//!
//! Ordered resolution of degraded results when a protected call cannot
//! complete: last-known-good cached payload, then a caller-supplied fallback,
//! then a generic offline stub, and finally a typed failure when nothing
//! resolves and offline mode is disallowed. First match wins.

use crate::error::{ResilienceError, Result};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

fn cache_key(service: &str) -> String {
    format!("cache:{service}:last_result")
}

/// Last-known-good payload for a service, owned by the state store with its
/// own TTL, independent of breaker state lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub service_name: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
}

/// Caller-supplied fallback: either a ready value or a handler invoked with
/// the triggering error.
pub enum Fallback {
    Value(Value),
    Handler(Box<dyn Fn(&ResilienceError) -> Value + Send + Sync>),
}

impl Fallback {
    pub fn value(value: Value) -> Self {
        Fallback::Value(value)
    }

    pub fn handler<F>(handler: F) -> Self
    where
        F: Fn(&ResilienceError) -> Value + Send + Sync + 'static,
    {
        Fallback::Handler(Box::new(handler))
    }

    fn produce(&self, error: &ResilienceError) -> Value {
        match self {
            Fallback::Value(value) => value.clone(),
            Fallback::Handler(handler) => handler(error),
        }
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Fallback::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Where a resolved result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// The wrapped operation itself succeeded.
    Primary,
    /// Served from the last-known-good cache.
    Cache,
    /// Produced by the caller-supplied fallback.
    CallerFallback,
    /// Generic offline-mode stub.
    OfflineStub,
}

/// A result delivered to the caller, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub payload: Value,
    pub source: ResolutionSource,
}

impl Resolved {
    pub fn primary(payload: Value) -> Self {
        Self {
            payload,
            source: ResolutionSource::Primary,
        }
    }

    /// Whether this is a degraded (non-primary) result.
    pub fn is_degraded(&self) -> bool {
        self.source != ResolutionSource::Primary
    }
}

/// Orders fallback sources for failed protected calls.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    store: Arc<dyn StateStore>,
}

impl FallbackChain {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Cache a successful payload for future fallback use.
    pub async fn cache_result(&self, service_name: &str, payload: Value, ttl: Duration) -> Result<()> {
        let cached = CachedResult {
            service_name: service_name.to_string(),
            payload,
            stored_at: Utc::now(),
        };
        let value = serde_json::to_value(&cached).map_err(|e| {
            crate::store::StoreError::serialization(cache_key(service_name), e.to_string())
        })?;
        self.store
            .put(&cache_key(service_name), value, Some(ttl))
            .await?;
        Ok(())
    }

    /// The unexpired cached result for a service, if any.
    pub async fn cached(&self, service_name: &str) -> Result<Option<CachedResult>> {
        match self.store.get(&cache_key(service_name)).await? {
            Some(value) => {
                let cached = serde_json::from_value(value).map_err(|e| {
                    crate::store::StoreError::serialization(cache_key(service_name), e.to_string())
                })?;
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    /// Resolve a failed call. First match wins: cache, caller fallback,
    /// offline stub. When nothing resolves and offline mode is disallowed,
    /// returns [`ResilienceError::NoFallbackAvailable`] noting whether the
    /// circuit was open.
    pub async fn resolve(
        &self,
        service_name: &str,
        error: &ResilienceError,
        fallback: Option<&Fallback>,
        allow_offline: bool,
    ) -> Result<Resolved> {
        if let Some(cached) = self.cached(service_name).await? {
            info!(
                service = %service_name,
                stored_at = %cached.stored_at,
                "Using cached data for failed service"
            );
            return Ok(Resolved {
                payload: cached.payload,
                source: ResolutionSource::Cache,
            });
        }

        if let Some(fallback) = fallback {
            info!(service = %service_name, "Using caller fallback for failed service");
            return Ok(Resolved {
                payload: fallback.produce(error),
                source: ResolutionSource::CallerFallback,
            });
        }

        if allow_offline {
            info!(service = %service_name, "Entering offline mode for failed service");
            return Ok(Resolved {
                payload: json!({ "offline": true, "service": service_name }),
                source: ResolutionSource::OfflineStub,
            });
        }

        error!(
            service = %service_name,
            error = %error,
            "No fallback available for failed service"
        );
        Err(ResilienceError::NoFallbackAvailable {
            service: service_name.to_string(),
            circuit_open: error.is_circuit_open(),
        })
    }
}
