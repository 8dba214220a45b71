use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{FeatureError, Result};
use crate::features::symbol::Symbol;

pub struct RedisManager {
    pool: Pool,
    default_ttl: Duration,
}

impl RedisManager {
    pub async fn new(url: &str, default_ttl_seconds: u64) -> Result<Self> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| FeatureError::Checkpoint(format!("failed to create Redis pool: {}", e)))?;

        // Test connection
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        info!("Connected to Redis successfully");

        Ok(Self {
            pool,
            default_ttl: Duration::from_secs(default_ttl_seconds),
        })
    }

    // Set a key with serialized value and TTL
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.pool.get().await?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        conn.set_ex::<_, _, ()>(key, serialized, ttl.as_secs() as usize).await?;
        Ok(())
    }

    // Get and deserialize a value by key
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.pool.get().await?;
        let result: Option<String> = conn.get(key).await?;

        match result {
            Some(val) => Ok(Some(serde_json::from_str(&val)?)),
            None => Ok(None),
        }
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    // Delete keys, returns how many existed
    pub async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let removed: usize = conn.del(keys).await?;
        Ok(removed)
    }

    pub fn checkpoint_key(run_key: &str, symbol: &Symbol) -> String {
        format!("checkpoint:{}:{}", run_key, symbol)
    }
}

/// Checkpoints kept in Redis so an interrupted backfill can resume from
/// another process.
pub struct RedisCheckpointStore {
    redis: RedisManager,
}

impl RedisCheckpointStore {
    pub fn new(redis: RedisManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn load(&self, run_key: &str, symbol: &Symbol) -> Result<Option<Checkpoint>> {
        self.redis.get(&RedisManager::checkpoint_key(run_key, symbol)).await
    }

    async fn save(&self, run_key: &str, checkpoint: &Checkpoint) -> Result<()> {
        let key = RedisManager::checkpoint_key(run_key, &checkpoint.symbol);
        debug!("Saving checkpoint {}", key);
        self.redis.set(&key, checkpoint, None).await
    }

    async fn list(&self, run_key: &str) -> Result<Vec<Checkpoint>> {
        let keys = self.redis.keys(&format!("checkpoint:{}:*", run_key)).await?;
        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(cp) = self.redis.get::<Checkpoint>(&key).await? {
                checkpoints.push(cp);
            }
        }
        checkpoints.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(checkpoints)
    }

    async fn clear(&self, run_key: &str) -> Result<usize> {
        let keys = self.redis.keys(&format!("checkpoint:{}:*", run_key)).await?;
        self.redis.delete_many(&keys).await
    }
}
