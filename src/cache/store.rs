use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::IndicatorSnapshot;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Key-value store for indicator snapshots
///
/// `set` must overwrite exactly; correctness never depends on expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IndicatorSnapshot>, CacheError>;
    async fn set(&self, key: &str, value: &IndicatorSnapshot) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, IndicatorSnapshot>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<IndicatorSnapshot>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &IndicatorSnapshot) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
