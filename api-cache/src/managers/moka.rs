use crate::{error::StoreError, CacheManager, CachedEntry};

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{future::Cache, Expiry};

#[derive(Clone)]
struct Stored {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Stored> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        (!value.ttl.is_zero()).then_some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        (!value.ttl.is_zero()).then_some(value.ttl)
    }
}

/// Implements [`CacheManager`] with [`moka`](https://github.com/moka-rs/moka) as the backend.
///
/// Each entry expires after the TTL it was written with.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaManager {
    cache: Arc<Cache<String, Stored>>,
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaManager")
            .field("entry_count", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MokaManager {
    /// Create a new manager holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache: Arc::new(cache) }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait::async_trait]
impl CacheManager for MokaManager {
    async fn get(
        &self,
        cache_key: &str,
    ) -> Result<Option<CachedEntry>, StoreError> {
        match self.cache.get(cache_key).await {
            Some(stored) => CachedEntry::from_slice(&stored.bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        cache_key: &str,
        entry: &CachedEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let bytes = entry.to_bytes()?;
        self.cache
            .insert(cache_key.to_string(), Stored { bytes: Arc::new(bytes), ttl })
            .await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(cache_key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.cache.invalidate(key.as_str()).await;
        }
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
