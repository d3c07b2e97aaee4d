use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::store::{CacheError, CacheStore};
use crate::models::IndicatorSnapshot;

/// Redis-backed snapshot store
///
/// Snapshots are stored as JSON strings without expiry. The connection
/// manager is cheap to clone, so each call works on its own handle.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Backend("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<IndicatorSnapshot>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: &IndicatorSnapshot) -> Result<(), CacheError> {
        let json = serde_json::to_string(value).map_err(|e| CacheError::Backend(e.to_string()))?;

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, json).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
