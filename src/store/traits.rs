//! `StateStore` trait: the shared key/value store with per-key expiry.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Backend-agnostic key/value store shared by every component.
///
/// Every value carries its own time-to-live. Expired keys behave exactly like
/// missing keys; `purge_expired` only reclaims space.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any existing one.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write a value only if no live value exists. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Remove a key. Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether a live value exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Drop expired entries. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}
