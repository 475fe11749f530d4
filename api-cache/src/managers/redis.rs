use crate::{
    config::StoreConfig, error::StoreError, logging::Logger, CacheManager,
    CachedEntry,
};

use std::{fmt, time::Duration};

use redis::{aio::ConnectionManager, AsyncCommands};

const SCAN_COUNT: usize = 100;

/// Implements [`CacheManager`] on a Redis or Valkey server through a
/// reconnecting [`ConnectionManager`].
///
/// Entries are stored as JSON with a millisecond expiry (`SET .. PX`).
#[cfg_attr(docsrs, doc(cfg(feature = "manager-redis")))]
#[derive(Clone)]
pub struct RedisManager {
    connection: ConnectionManager,
    logger: Logger,
}

impl fmt::Debug for RedisManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedisManager").finish_non_exhaustive()
    }
}

impl RedisManager {
    /// Connects to the server at `url`, e.g. `redis://localhost:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection, logger: Logger::global() })
    }

    /// Connects using the `store` section of the configuration.
    pub async fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::connect(&config.redis_url()).await
    }

    /// Replaces the logging handle.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Checks the connection with `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait::async_trait]
impl CacheManager for RedisManager {
    async fn get(
        &self,
        cache_key: &str,
    ) -> Result<Option<CachedEntry>, StoreError> {
        let mut conn = self.connection.clone();
        let bytes: Option<Vec<u8>> = conn.get(cache_key).await?;
        bytes.map(|bytes| CachedEntry::from_slice(&bytes)).transpose()
    }

    async fn set(
        &self,
        cache_key: &str,
        entry: &CachedEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let bytes = entry.to_bytes()?;
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(cache_key).arg(bytes);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(cache_key).await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        for key in keys {
            let deleted: redis::RedisResult<()> = conn.del(&key).await;
            if let Err(e) = deleted {
                log_warn!(
                    self.logger,
                    "failed to delete cache key during prefix delete key={key} error={e}"
                );
            }
        }
        Ok(())
    }
}
