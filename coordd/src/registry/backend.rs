use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::broadcast;
use shared::types::{ServiceRecord, WatchEvent};
use crate::error::RegistryError;

/// Storage behind the registry.
///
/// Implementations must treat a record as gone once its TTL has elapsed
/// without a fresh `put`, and must not report expiry as a delete event.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Write the record and reset its TTL
    async fn put(&self, record: &ServiceRecord, ttl: Duration) -> Result<(), RegistryError>;

    /// Remove a record. Returns whether a live record was removed.
    async fn remove(&self, name: &str) -> Result<bool, RegistryError>;

    async fn get(&self, name: &str) -> Result<Option<ServiceRecord>, RegistryError>;

    async fn list(&self) -> Result<Vec<ServiceRecord>, RegistryError>;

    /// Change feed, or `None` when the store cannot push changes
    fn subscribe(&self) -> Option<broadcast::Receiver<WatchEvent>>;
}
