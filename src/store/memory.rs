//! In-memory state store backed by a sharded concurrent map.
//!
//! Expiry is lazy: entries are checked against their deadline on access and
//! dropped when stale. Single-key operations take the shard write lock
//! through the map's entry API, which is what makes `increment` and
//! `add_to_set` atomic per key.

use super::{StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Process-local [`StateStore`] implementation.
///
/// Suitable for single-process deployments and tests. Cross-process sharing
/// requires an external backend implementing the same trait.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries. Expired-but-unswept entries are excluded.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        // The entry guard holds the shard write lock for the whole
        // read-modify-write, making the increment atomic per key.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(json!(0), ttl));

        let current = if entry.is_expired() {
            0
        } else {
            entry.value.as_i64().ok_or_else(|| {
                StoreError::serialization(key, "increment target is not an integer")
            })?
        };

        let next = current + 1;
        entry.value = json!(next);
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(next)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(json!([]), ttl));

        if entry.is_expired() {
            entry.value = json!([]);
        }

        let members = entry.value.as_array_mut().ok_or_else(|| {
            StoreError::serialization(key, "set target is not an array")
        })?;

        if !members.iter().any(|m| m.as_str() == Some(member)) {
            members.push(json!(member));
        }
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.get(key).await? {
            Some(Value::Array(members)) => Ok(members
                .iter()
                .filter_map(|m| m.as_str().map(String::from))
                .collect()),
            Some(_) => Err(StoreError::serialization(key, "set target is not an array")),
            None => Ok(Vec::new()),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect())
    }
}
