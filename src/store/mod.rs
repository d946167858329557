//! # Shared State Store
//!
//! Key-value store with per-key TTL shared by every resilience component.
//! Breaker state, counters, cached payloads, pending sync items, and the
//! service registry all live here; no component keeps private copies. The
//! [`StateStore`] trait is the seam for swapping the backend (the in-memory
//! implementation ships with the crate, a Redis-like backend can implement
//! the same trait).
//!
//! The `increment` operation is required to be atomic per key. Breaker
//! counter updates rely on that guarantee instead of performing a naive
//! read-then-write.

pub mod memory;

pub use memory::MemoryStateStore;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Errors raised by state store backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("serialization failed for key {key}: {message}")]
    Serialization { key: String, message: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn serialization(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Serialization {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared key-value store with per-key TTL.
///
/// Keys follow the `component:{service}:field` namespace convention, e.g.
/// `breaker:billing_api:failures` or `sync:ocr_service:{item_id}`.
#[async_trait]
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Fetch a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Store a value, replacing any previous one. `ttl = None` means no expiry.
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically increment a numeric counter and return the new value.
    ///
    /// Absent or expired counters start from zero. The TTL is refreshed on
    /// every increment. Implementations must make the read-modify-write
    /// atomic for a single key under concurrent callers.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64>;

    /// Idempotently add a member to a string set, refreshing the set's TTL.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Members of a string set; empty when absent or expired.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Live (unexpired) keys starting with the given prefix.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
