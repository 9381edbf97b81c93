use std::time::Duration;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use shared::types::{ServiceRecord, WatchEvent};
use crate::error::RegistryError;
use super::backend::RegistryBackend;

/// Records live under `<prefix><name>` as JSON with a native Redis TTL,
/// so expiry is enforced by the store itself.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisBackend {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, RegistryError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected registry to Redis at {}", url);
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        record_key(&self.key_prefix, name)
    }
}

fn record_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Pair MGET results back with their keys. Vanished and malformed entries
/// are skipped.
fn decode_records(keys: &[String], values: Vec<Option<String>>) -> Vec<ServiceRecord> {
    let mut records = Vec::with_capacity(values.len());
    for (key, value) in keys.iter().zip(values) {
        let Some(json) = value else { continue };
        match serde_json::from_str::<ServiceRecord>(&json) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping malformed registry entry {}: {}", key, e),
        }
    }
    records
}

#[async_trait]
impl RegistryBackend for RedisBackend {
    async fn put(&self, record: &ServiceRecord, ttl: Duration) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        let _: () = conn.set_ex(self.key(&record.name), json, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(name)).await?;
        Ok(removed > 0)
    }

    async fn get(&self, name: &str) -> Result<Option<ServiceRecord>, RegistryError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.key(name)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>, RegistryError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.key_prefix);

        let keys: Vec<String> = {
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Keys may expire between SCAN and MGET
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(decode_records(&keys, values))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<WatchEvent>> {
        None
    }
}
