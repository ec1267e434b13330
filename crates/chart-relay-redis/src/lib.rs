//! Redis backend for the chart relay
//!
//! Implements the relay's `KvStore` contract over a Redis connection
//! manager. Log records are plain string keys with per-key TTL, matching the
//! relay's whole-record expiry model.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use chart_relay::{KvStore, StorageError};

/// Redis-backed key-value store.
///
/// # Example
///
/// ```rust,ignore
/// use chart_relay::{RelayConfig, RelayService};
/// use chart_relay_redis::RedisKv;
///
/// let store = RedisKv::new();
/// store.connect("redis://localhost:6379").await?;
/// let relay = RelayService::new(store, RelayConfig::default());
/// ```
#[derive(Clone, Default)]
pub struct RedisKv {
    redis: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to Redis. Until this succeeds every operation reports
    /// `StorageError::Unavailable`, which the relay degrades around.
    pub async fn connect(&self, redis_url: &str) -> anyhow::Result<()> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        *self.redis.write().await = Some(manager);
        info!("Redis storage connected");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.redis.read().await.is_some()
    }

    async fn conn(&self) -> Result<ConnectionManager, StorageError> {
        self.redis
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::Unavailable("redis not connected".to_string()))
    }
}

fn map_err(e: redis::RedisError) -> StorageError {
    // Redis reports memory pressure as an OOM command error
    if e.to_string().contains("OOM") {
        StorageError::QuotaExceeded(e.to_string())
    } else {
        StorageError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn).await.map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", prefix.replace('*', "\\*"));
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 || keys.len() >= limit {
                break;
            }
        }
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
