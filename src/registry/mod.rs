//! # Service Registry
//!
//! Append-only, deduplicated set of service names that have passed through
//! the resilience layer. Used for enumeration only (dashboards,
//! `status_all`); registration is idempotent and refreshes the set's TTL so
//! stale deployments age out of the listing.

use crate::error::Result;
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;

const REGISTRY_KEY: &str = "registry:services";
const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(30 * 60);

/// Registry of known service names, owned by the shared state store.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_REGISTRY_TTL,
        }
    }

    pub fn with_ttl(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Record a service name. Inserting an already-known name only refreshes
    /// the registry TTL.
    pub async fn register(&self, service_name: &str) -> Result<()> {
        self.store
            .add_to_set(REGISTRY_KEY, service_name, Some(self.ttl))
            .await?;
        Ok(())
    }

    /// All currently known service names.
    pub async fn services(&self) -> Result<Vec<String>> {
        let mut services = self.store.set_members(REGISTRY_KEY).await?;
        services.sort();
        Ok(services)
    }
}
