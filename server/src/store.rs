//! Timeline store.
//!
//! Each timestamp key holds a list of coordinate strings appended in
//! arrival order: `[lat, lon, lat, lon, …]`. Lists are created by the first
//! append and never deleted here; expiry belongs to whoever runs Redis.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::RelayError;

/// Key/value operations the relay needs. Implementations must be safe for
/// concurrent callers issuing independent key operations, and a single
/// `append` must be atomic.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Append `values` to the list at `key`, creating it if needed.
    async fn append(&self, key: &str, values: &[String]) -> Result<(), RelayError>;

    /// Whole list at `key`, in append order. Missing keys are empty.
    async fn range(&self, key: &str) -> Result<Vec<String>, RelayError>;

    /// Every key, in no particular order.
    async fn keys(&self) -> Result<Vec<String>, RelayError>;
}

// ═══════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl LocationStore for RedisStore {
    async fn append(&self, key: &str, values: &[String]) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, values).await?;
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, RelayError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(values)
    }

    async fn keys(&self) -> Result<Vec<String>, RelayError> {
        let mut conn = self.conn.clone();
        let mut iter = conn.scan_match::<_, String>("*").await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

// ═══════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════

/// Process-local store for tests and broker-only local runs.
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn append(&self, key: &str, values: &[String]) -> Result<(), RelayError> {
        let mut lists = self.lists.lock().await;
        lists
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, RelayError> {
        let lists = self.lists.lock().await;
        Ok(lists.get(key).cloned().unwrap_or_default())
    }

    async fn keys(&self) -> Result<Vec<String>, RelayError> {
        let lists = self.lists.lock().await;
        Ok(lists.keys().cloned().collect())
    }
}
