//! # Offline Sync Queue
//!
//! Cache-backed queue of operations deferred while a service was
//! unavailable, replayed once its breaker admits calls again. Replay is
//! best-effort at-least-once with a bounded attempt count: an item failing
//! replay three times is dead-lettered (removed, logged, counted) rather
//! than retried forever.

use crate::breaker::CircuitBreaker;
use crate::config::OfflineSyncConfig;
use crate::error::{OperationError, ResilienceError, Result};
use crate::registry::ServiceRegistry;
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

fn item_key(service: &str, item_id: &str) -> String {
    format!("sync:{service}:{item_id}")
}

fn service_prefix(service: &str) -> String {
    format!("sync:{service}:")
}

/// An operation awaiting replay against a recovered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncItem {
    pub id: String,
    pub service_name: String,
    pub operation: String,
    pub payload: Value,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Dispatch seam for replaying deferred operations. Implementations route
/// the item back through the same operation dispatch the live call used.
#[async_trait]
pub trait ReplayHandler: Send + Sync + fmt::Debug {
    async fn replay(&self, item: &PendingSyncItem) -> std::result::Result<(), OperationError>;
}

/// Outcome of a drain pass over one service's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Items replayed successfully and removed.
    pub synchronized: u32,
    /// Items that failed replay and were re-queued for another pass.
    pub failed: u32,
    /// Items that exhausted their replay budget and were discarded.
    pub dead_lettered: u32,
}

/// Queue of deferred operations, owned by the shared state store.
#[derive(Debug, Clone)]
pub struct OfflineSyncQueue {
    store: Arc<dyn StateStore>,
    breaker: Arc<CircuitBreaker>,
    registry: ServiceRegistry,
    config: OfflineSyncConfig,
}

impl OfflineSyncQueue {
    pub fn new(
        store: Arc<dyn StateStore>,
        breaker: Arc<CircuitBreaker>,
        config: OfflineSyncConfig,
    ) -> Self {
        let registry = ServiceRegistry::new(Arc::clone(&store));
        Self {
            store,
            breaker,
            registry,
            config,
        }
    }

    /// Defer an operation for later replay. Returns the queued item's id,
    /// which doubles as the job id for scheduler collaborators.
    pub async fn enqueue(
        &self,
        service_name: &str,
        operation: &str,
        payload: Value,
    ) -> Result<String> {
        let item = PendingSyncItem {
            id: Uuid::new_v4().to_string(),
            service_name: service_name.to_string(),
            operation: operation.to_string(),
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
        };

        self.put_item(&item).await?;
        // Deferred-only services still show up in drain_all and status_all.
        self.registry.register(service_name).await?;

        info!(
            service = %service_name,
            operation = %operation,
            item_id = %item.id,
            "Queued operation for later execution"
        );
        Ok(item.id)
    }

    /// Pending items for a service, oldest first.
    pub async fn pending(&self, service_name: &str) -> Result<Vec<PendingSyncItem>> {
        let keys = self
            .store
            .keys_with_prefix(&service_prefix(service_name))
            .await?;

        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.store.get(&key).await? {
                let item: PendingSyncItem = serde_json::from_value(value)
                    .map_err(|e| crate::store::StoreError::serialization(&key, e.to_string()))?;
                items.push(item);
            }
        }
        items.sort_by_key(|item| item.enqueued_at);
        Ok(items)
    }

    /// Replay every pending item for a service through `handler`.
    ///
    /// Proceeds only when the breaker admits calls; otherwise raises
    /// [`ResilienceError::ServiceUnavailable`]. Replay outcomes are reported
    /// back to the breaker like live calls.
    pub async fn drain(
        &self,
        service_name: &str,
        handler: &dyn ReplayHandler,
    ) -> Result<DrainReport> {
        if !self.breaker.admit(service_name).await?.is_admitted() {
            return Err(ResilienceError::ServiceUnavailable {
                service: service_name.to_string(),
            });
        }

        let mut report = DrainReport::default();
        for mut item in self.pending(service_name).await? {
            match handler.replay(&item).await {
                Ok(()) => {
                    self.store
                        .delete(&item_key(service_name, &item.id))
                        .await?;
                    self.breaker.on_success(service_name).await?;
                    report.synchronized += 1;
                }
                Err(error) => {
                    self.breaker.on_failure(service_name, &error).await?;
                    item.attempts += 1;

                    if item.attempts >= self.config.max_replay_attempts {
                        self.store
                            .delete(&item_key(service_name, &item.id))
                            .await?;
                        warn!(
                            service = %service_name,
                            item_id = %item.id,
                            operation = %item.operation,
                            attempts = item.attempts,
                            error = %error,
                            "Sync item dead-lettered after exhausting replay attempts"
                        );
                        report.dead_lettered += 1;
                    } else {
                        self.put_item(&item).await?;
                        report.failed += 1;
                    }
                }
            }
        }

        crate::logging::log_sync_operation(
            service_name,
            "drain",
            report.synchronized,
            report.failed,
            report.dead_lettered,
        );
        Ok(report)
    }

    /// Replay pending items for every registered service.
    ///
    /// Services whose breaker rejects admission are skipped, not failed;
    /// their items stay queued for a later pass. Returns the combined
    /// report across all drained services.
    pub async fn drain_all(&self, handler: &dyn ReplayHandler) -> Result<DrainReport> {
        let mut combined = DrainReport::default();
        for service in self.registry.services().await? {
            match self.drain(&service, handler).await {
                Ok(report) => {
                    combined.synchronized += report.synchronized;
                    combined.failed += report.failed;
                    combined.dead_lettered += report.dead_lettered;
                }
                Err(ResilienceError::ServiceUnavailable { .. }) => {
                    info!(service = %service, "Skipping sync for unavailable service");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(combined)
    }

    async fn put_item(&self, item: &PendingSyncItem) -> Result<()> {
        let key = item_key(&item.service_name, &item.id);
        let value = serde_json::to_value(item)
            .map_err(|e| crate::store::StoreError::serialization(&key, e.to_string()))?;
        self.store
            .put(&key, value, Some(self.config.item_ttl()))
            .await?;
        Ok(())
    }
}
