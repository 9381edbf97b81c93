pub mod space;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use shared::key::CacheKey;
use shared::protocol::{CACHE_TOPIC, WILDCARD};
use shared::types::{CacheAction, CacheMessage};
use crate::broadcast::Broadcaster;
use crate::error::CacheError;

pub use space::{CacheHandler, CacheSpace};

#[derive(Default)]
struct Spaces {
    spaces: RwLock<HashMap<String, Arc<CacheSpace>>>,
    /// Handlers subscribed with a wildcard module filter
    global: RwLock<Vec<CacheHandler>>,
}

impl Spaces {
    fn get_or_create(&self, module: &str) -> Arc<CacheSpace> {
        if let Some(space) = self
            .spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
        {
            return space.clone();
        }
        self.spaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(CacheSpace::new(module)))
            .clone()
    }

    fn apply(&self, message: &CacheMessage) -> usize {
        let raised = self.get_or_create(&message.module).apply(message);

        let global: Vec<CacheHandler> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &global {
            tokio::spawn(handler(message.clone()));
        }
        raised + global.len()
    }
}

fn filter_matches(filter: &str, value: &str) -> bool {
    filter == WILDCARD || filter == value
}

/// Per-module key/value mirrors replicated over the broadcast bus.
///
/// Known limitation: the value under a key is whatever message arrived
/// last at this process. No sequence or causality is carried, so two
/// processes writing the same key concurrently can leave different
/// mirrors permanently disagreeing until the key is written again.
pub struct CacheBroadcaster {
    broadcaster: Arc<Broadcaster>,
    spaces: Arc<Spaces>,
}

impl CacheBroadcaster {
    /// Attach to the cache topic of `broadcaster`
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        let spaces = Arc::new(Spaces::default());

        let inbound = spaces.clone();
        let own_node = broadcaster.identity().node_id.clone();
        broadcaster.subscribe(CACHE_TOPIC, move |envelope| {
            // Our own broadcasts were applied before they were sent
            if envelope.node_id == own_node {
                return;
            }
            match serde_json::from_value::<CacheMessage>(envelope.payload.clone()) {
                Ok(message) => {
                    inbound.apply(&message);
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed cache message from {}: {}",
                        envelope.node_id,
                        e
                    );
                }
            }
        });

        Self {
            broadcaster,
            spaces,
        }
    }

    /// The mirror for `module`, created on first access
    pub fn get_cache_space(&self, module: &str) -> Arc<CacheSpace> {
        self.spaces.get_or_create(module)
    }

    /// Modules with a mirror in this process
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .spaces
            .spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        modules.sort();
        modules
    }

    /// Write locally, then replicate to every other node.
    /// Returns the number of pushes queued.
    pub async fn broadcast<T: Serialize>(
        &self,
        module: &str,
        key: impl CacheKey,
        value: &T,
    ) -> Result<usize, CacheError> {
        let payload = serde_json::to_string(value)?;
        Ok(self.publish(CacheAction::Set, module, key.to_key(), payload).await)
    }

    pub async fn broadcast_delete(&self, module: &str, key: impl CacheKey) -> usize {
        self.publish(CacheAction::Delete, module, key.to_key(), String::new()).await
    }

    pub async fn broadcast_clear(&self, module: &str) -> usize {
        self.publish(CacheAction::Clear, module, String::new(), String::new()).await
    }

    /// Raise `handler` for changes whose origin service and module match
    /// the filters; `"*"` matches anything.
    pub fn subscribe<F, Fut>(&self, service_filter: &str, module_filter: &str, handler: F)
    where
        F: Fn(CacheMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service_filter = service_filter.to_string();
        let module_filter = module_filter.to_string();
        let global = module_filter == WILDCARD;
        let target_module = module_filter.clone();

        let wrapped: CacheHandler = Arc::new(move |message: CacheMessage| {
            if filter_matches(&service_filter, &message.service)
                && filter_matches(&module_filter, &message.module)
            {
                handler(message).boxed()
            } else {
                futures::future::ready(()).boxed()
            }
        });

        if global {
            self.spaces
                .global
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(wrapped);
        } else {
            self.spaces.get_or_create(&target_module).add_any_handler(wrapped);
        }
    }

    async fn publish(&self, action: CacheAction, module: &str, key: String, payload: String) -> usize {
        let message = CacheMessage {
            service: self.broadcaster.identity().service.clone(),
            module: module.to_string(),
            key,
            payload,
            action,
            timestamp: Utc::now(),
        };

        self.spaces.apply(&message);

        match serde_json::to_value(&message) {
            Ok(value) => self.broadcaster.send(CACHE_TOPIC, value, "").await,
            Err(e) => {
                tracing::warn!("Cache change for {} not replicated: {}", module, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::json;
    use tokio::sync::mpsc;
    use shared::types::BroadcastMessage;
    use crate::broadcast::tests::test_broadcaster;

    fn envelope(node_id: &str, message: &CacheMessage) -> BroadcastMessage {
        BroadcastMessage {
            topic: CACHE_TOPIC.to_string(),
            service: message.service.clone(),
            node_id: node_id.to_string(),
            target: String::new(),
            payload: serde_json::to_value(message).unwrap(),
            timestamp: Utc::now(),
        }
    }

    fn remote_set(service: &str, module: &str, key: &str, payload: &str) -> CacheMessage {
        CacheMessage {
            service: service.to_string(),
            module: module.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
            action: CacheAction::Set,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_writes_locally_and_pushes() {
        let broadcaster = test_broadcaster().await;
        let caches = CacheBroadcaster::new(broadcaster);

        let queued = caches
            .broadcast("rbac", "role:1", &json!({"perms": ["dict:read"]}))
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let space = caches.get_cache_space("rbac");
        let value: serde_json::Value = space.get("role:1").unwrap().unwrap();
        assert_eq!(value["perms"][0], "dict:read");

        caches.broadcast_delete("rbac", "role:1").await;
        assert!(!space.contains("role:1"));

        caches.broadcast("rbac", 2u64, &"x").await.unwrap();
        caches.broadcast_clear("rbac").await;
        assert!(space.is_empty());
        assert_eq!(caches.modules(), vec!["rbac".to_string()]);
    }

    #[tokio::test]
    async fn test_inbound_creates_space_and_skips_own_echo() {
        let broadcaster = test_broadcaster().await;
        let caches = CacheBroadcaster::new(broadcaster.clone());

        let msg = remote_set("auth-svc", "menus", "m1", "\"home\"");
        broadcaster.handle_inbound(envelope("other-1", &msg));
        assert_eq!(caches.get_cache_space("menus").get_raw("m1").as_deref(), Some("\"home\""));

        let echo = remote_set("self", "menus", "m2", "1");
        broadcaster.handle_inbound(envelope("self-1", &echo));
        assert!(!caches.get_cache_space("menus").contains("m2"));

        // Malformed payload is dropped without touching any space
        broadcaster.handle_inbound(BroadcastMessage {
            payload: json!("nope"),
            ..envelope("other-1", &msg)
        });
        assert_eq!(caches.get_cache_space("menus").len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_filters() {
        let broadcaster = test_broadcaster().await;
        let caches = CacheBroadcaster::new(broadcaster.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let exact = tx.clone();
        caches.subscribe("auth-svc", "rbac", move |msg| {
            let tx = exact.clone();
            async move {
                let _ = tx.send(format!("exact:{}/{}", msg.service, msg.key));
            }
        });
        let any = tx.clone();
        caches.subscribe("*", "*", move |msg| {
            let tx = any.clone();
            async move {
                let _ = tx.send(format!("any:{}/{}", msg.module, msg.key));
            }
        });

        broadcaster.handle_inbound(envelope("other-1", &remote_set("auth-svc", "rbac", "k1", "1")));
        broadcaster.handle_inbound(envelope("other-1", &remote_set("dict-svc", "rbac", "k2", "1")));
        broadcaster.handle_inbound(envelope("other-1", &remote_set("auth-svc", "menus", "k3", "1")));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            seen.push(got);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "any:menus/k3".to_string(),
                "any:rbac/k1".to_string(),
                "any:rbac/k2".to_string(),
                "exact:auth-svc/k1".to_string(),
            ]
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
