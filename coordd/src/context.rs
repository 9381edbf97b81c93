use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use shared::key::CacheKey;
use shared::protocol::{META_BASE_PATH, META_ROUTES};
use shared::types::{BroadcastMessage, LifecycleEvent, LifecycleMessage, Node, ServiceRecord};
use crate::broadcast::{Broadcaster, NodeIdentity, Pusher};
use crate::cache::{CacheBroadcaster, CacheSpace};
use crate::config::{BackendKind, Config, NodeConfig};
use crate::error::{CacheError, RegistryError};
use crate::lifecycle::LifecycleManager;
use crate::registry::{RedisBackend, Registry};

/// The record this process registers for itself
pub fn own_record(node: &NodeConfig, node_id: &str) -> Result<ServiceRecord, serde_json::Error> {
    let mut metadata = node.metadata.clone();
    if let Some(base) = node.base_path.as_deref().filter(|b| !b.trim().is_empty()) {
        metadata.insert(META_BASE_PATH.to_string(), base.to_string());
    }
    if !node.routes.is_empty() {
        metadata.insert(META_ROUTES.to_string(), serde_json::to_string(&node.routes)?);
    }

    Ok(ServiceRecord::new(
        node.service.clone(),
        node.version.clone(),
        vec![Node {
            id: node_id.to_string(),
            address: node.advertise_addr().to_string(),
            metadata,
        }],
    ))
}

/// Process-wide coordination context. One per process owns the registry
/// client, the broadcast bus and everything layered on it.
pub struct Coordinator {
    config: Config,
    record: ServiceRecord,
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    lifecycle: Arc<LifecycleManager>,
    caches: Arc<CacheBroadcaster>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Connect the configured registry backend and wire the bus
    pub async fn build(config: Config, cancel: CancellationToken) -> Result<Self> {
        let registry = match config.registry.backend {
            BackendKind::Memory => {
                tracing::warn!("Using in-process registry; peers in other processes are invisible");
                Registry::in_memory(config.registry.ttl(), cancel.clone())
            }
            BackendKind::Redis => {
                let backend = RedisBackend::connect(&config.registry.redis_url, &config.registry.key_prefix)
                    .await
                    .with_context(|| format!("Failed to connect registry at {}", config.registry.redis_url))?;
                Registry::new(Arc::new(backend), config.registry.ttl(), cancel.clone())
            }
        };
        Self::with_registry(config, Arc::new(registry), cancel)
    }

    pub fn with_registry(config: Config, registry: Arc<Registry>, cancel: CancellationToken) -> Result<Self> {
        let node_id = config.node.resolve_node_id();
        let record = own_record(&config.node, &node_id).context("Failed to encode route metadata")?;

        let identity = NodeIdentity {
            service: config.node.service.clone(),
            node_id,
            address: config.node.advertise_addr().to_string(),
        };
        let pusher = Pusher::spawn(&config.broadcast, cancel.clone());
        let broadcaster = Arc::new(Broadcaster::new(identity, registry.clone(), pusher));
        let lifecycle = Arc::new(LifecycleManager::new(broadcaster.clone()));
        let caches = Arc::new(CacheBroadcaster::new(broadcaster.clone()));

        Ok(Self {
            config,
            record,
            registry,
            broadcaster,
            lifecycle,
            caches,
            cancel,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.broadcaster.identity()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn caches(&self) -> &Arc<CacheBroadcaster> {
        &self.caches
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register this process and announce starting, started, ready
    pub async fn start(&self) -> Result<(), RegistryError> {
        self.lifecycle.emit(LifecycleEvent::Starting, HashMap::new()).await;
        self.registry.register(self.record.clone()).await?;
        self.lifecycle.emit(LifecycleEvent::Started, HashMap::new()).await;

        let metadata = HashMap::from([("version".to_string(), self.record.version.clone())]);
        self.lifecycle.emit(LifecycleEvent::Ready, metadata).await;
        Ok(())
    }

    /// Announce stopping, deregister, announce stopped, then cancel every
    /// background task. Failures are logged.
    pub async fn shutdown(&self) {
        self.lifecycle.emit(LifecycleEvent::Stopping, HashMap::new()).await;
        if let Err(e) = self.registry.deregister(&self.record).await {
            tracing::error!("Failed to deregister {}: {}", self.record.name, e);
        }
        self.lifecycle.emit(LifecycleEvent::Stopped, HashMap::new()).await;

        self.registry.shutdown();
        self.cancel.cancel();
        tracing::info!("Coordinator for {} shut down", self.record.name);
    }

    pub fn get_cache_space(&self, module: &str) -> Arc<CacheSpace> {
        self.caches.get_cache_space(module)
    }

    pub async fn broadcast<T: Serialize>(
        &self,
        module: &str,
        key: impl CacheKey,
        value: &T,
    ) -> Result<usize, CacheError> {
        self.caches.broadcast(module, key, value).await
    }

    pub fn on_service_ready<F, Fut>(&self, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.lifecycle.on_service_ready(handler);
    }

    pub fn on_service_stopped<F, Fut>(&self, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.lifecycle.on_service_stopped(handler);
    }

    /// Full broadcast on an application topic
    pub async fn publish_topic(&self, topic: &str, payload: Value) -> usize {
        self.broadcaster.send(topic, payload, "").await
    }

    pub fn subscribe_topic<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(topic, handler);
    }
}
