use std::time::Duration;

use crate::{error::StoreError, CachedEntry};

#[cfg(feature = "manager-moka")]
pub mod moka;

#[cfg(feature = "manager-redis")]
pub mod redis;

/// A trait providing methods for storing, reading, and removing cache entries.
///
/// Expiry belongs to the backend: an entry written with a TTL must stop
/// being returned once the TTL has elapsed. A zero TTL stores the entry
/// without expiry.
#[async_trait::async_trait]
pub trait CacheManager: Send + Sync + 'static {
    /// Attempts to pull an entry from the store. `Ok(None)` means not found.
    async fn get(
        &self,
        cache_key: &str,
    ) -> Result<Option<CachedEntry>, StoreError>;
    /// Attempts to store an entry, replacing any previous one.
    async fn set(
        &self,
        cache_key: &str,
        entry: &CachedEntry,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    /// Attempts to remove an entry.
    async fn delete(&self, cache_key: &str) -> Result<(), StoreError>;
    /// Attempts to remove every entry whose key starts with `prefix`.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}
