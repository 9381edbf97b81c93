use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use shared::types::{ServiceRecord, WatchAction, WatchEvent};
use crate::error::RegistryError;
use super::backend::RegistryBackend;

struct Entry {
    record: ServiceRecord,
    // None when the ttl does not fit in an Instant
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// In-process registry store for bootstrap and single-process deployments.
/// Expired records are dropped lazily on the next read.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn notify(&self, action: WatchAction, record: ServiceRecord) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent { action, record });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn put(&self, record: &ServiceRecord, ttl: Duration) -> Result<(), RegistryError> {
        let now = Instant::now();
        let action = {
            let mut entries = self.entries.write().await;
            let action = match entries.get(&record.name) {
                Some(old) if old.is_live(now) && old.record == *record => None,
                Some(old) if old.is_live(now) => Some(WatchAction::Update),
                _ => Some(WatchAction::Create),
            };
            entries.insert(
                record.name.clone(),
                Entry {
                    record: record.clone(),
                    expires_at: now.checked_add(ttl),
                },
            );
            action
        };

        // Heartbeat re-writes of an unchanged record stay quiet
        if let Some(action) = action {
            self.notify(action, record.clone());
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let removed = self.entries.write().await.remove(name);
        match removed {
            Some(entry) if entry.is_live(Instant::now()) => {
                self.notify(WatchAction::Delete, entry.record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<ServiceRecord>, RegistryError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(name) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.record.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(name).is_some_and(|e| !e.is_live(now)) {
            entries.remove(name);
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>, RegistryError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        Ok(entries.values().map(|e| e.record.clone()).collect())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<WatchEvent>> {
        Some(self.events.subscribe())
    }
}
