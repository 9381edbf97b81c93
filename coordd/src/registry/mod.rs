pub mod backend;
pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::HEARTBEAT_DIVISOR;
use shared::types::{ServiceRecord, WatchEvent};
use crate::error::RegistryError;

pub use backend::RegistryBackend;
pub use memory::MemoryBackend;
pub use redis_store::RedisBackend;

struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn abort(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// Liveness-tracked service registry.
///
/// Records are written with a TTL and kept alive by a heartbeat task owned
/// by the registering process. A record that stops being refreshed simply
/// stops being returned.
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    ttl: Duration,
    heartbeats: Mutex<HashMap<String, Heartbeat>>,
    cancel: CancellationToken,
}

impl Registry {
    /// Heartbeats and watches are children of `cancel`
    pub fn new(backend: Arc<dyn RegistryBackend>, ttl: Duration, cancel: CancellationToken) -> Self {
        Self {
            backend,
            ttl,
            heartbeats: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// In-process registry
    pub fn in_memory(ttl: Duration, cancel: CancellationToken) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), ttl, cancel)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl / HEARTBEAT_DIVISOR
    }

    /// Upsert the record and (re)start its heartbeat. Idempotent.
    pub async fn register(&self, record: ServiceRecord) -> Result<(), RegistryError> {
        if record.nodes.is_empty() {
            return Err(RegistryError::EmptyRecord(record.name));
        }

        self.backend.put(&record, self.ttl).await?;
        tracing::info!(
            "Registered {} ({} node(s), ttl {:?})",
            record.name,
            record.nodes.len(),
            self.ttl
        );

        self.start_heartbeat(record);
        Ok(())
    }

    /// Remove the record and stop its heartbeat. No-op if absent.
    pub async fn deregister(&self, record: &ServiceRecord) -> Result<(), RegistryError> {
        // A refresh already in flight must land before the remove, not after
        if let Some(heartbeat) = self.take_heartbeat(&record.name) {
            heartbeat.token.cancel();
            if let Err(e) = heartbeat.handle.await {
                tracing::warn!("Heartbeat for {} ended abnormally: {}", record.name, e);
            }
        }
        if self.backend.remove(&record.name).await? {
            tracing::info!("Deregistered {}", record.name);
        }
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceRecord, RegistryError> {
        self.backend
            .get(name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Full scan, meant for periodic resync rather than per-request lookups
    pub async fn list_services(&self) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.backend.list().await
    }

    /// Best-effort change stream; see [`RegistryWatch`]
    pub fn watch(&self) -> RegistryWatch {
        RegistryWatch {
            rx: self.backend.subscribe(),
            stop: self.cancel.child_token(),
        }
    }

    /// Stop refreshing a record without removing it. Returns whether a
    /// heartbeat was running.
    pub fn stop_heartbeat(&self, name: &str) -> bool {
        match self.take_heartbeat(name) {
            Some(heartbeat) => {
                heartbeat.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every heartbeat this registry owns
    pub fn shutdown(&self) {
        let heartbeats: Vec<Heartbeat> = self
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for heartbeat in heartbeats {
            heartbeat.abort();
        }
    }

    fn take_heartbeat(&self, name: &str) -> Option<Heartbeat> {
        self.heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    fn start_heartbeat(&self, record: ServiceRecord) {
        let token = self.cancel.child_token();
        let name = record.name.clone();
        let backend = self.backend.clone();
        let ttl = self.ttl;
        let every = self.heartbeat_interval();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = backend.put(&record, ttl).await {
                            tracing::warn!("Heartbeat for {} failed: {}", record.name, e);
                        }
                    }
                    _ = task_token.cancelled() => {
                        tracing::debug!("Heartbeat for {} stopped", record.name);
                        break;
                    }
                }
            }
        });

        let previous = self
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Heartbeat { token, handle });
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Registry change stream.
///
/// When the backend cannot push changes this never yields an event and
/// only returns `None` once stopped, so it must not be the only resync
/// trigger.
pub struct RegistryWatch {
    rx: Option<broadcast::Receiver<WatchEvent>>,
    stop: CancellationToken,
}

impl RegistryWatch {
    /// Next change, or `None` after [`stop`](Self::stop) or shutdown
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                self.stop.cancelled().await;
                return None;
            };

            let result = tokio::select! {
                _ = self.stop.cancelled() => return None,
                result = rx.recv() => result,
            };

            match result {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Registry watch lagged, {} event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => self.rx = None,
            }
        }
    }

    /// Whether the backend pushes changes at all
    pub fn is_push(&self) -> bool {
        self.rx.is_some()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}
