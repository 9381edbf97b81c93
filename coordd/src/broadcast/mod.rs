pub mod push;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use chrono::Utc;
use serde_json::Value;
use shared::protocol::BROADCAST_PATH;
use shared::types::BroadcastMessage;
use crate::error::RegistryError;
use crate::registry::Registry;

pub use push::{node_url, PushJob, Pusher};

pub type MessageHandler = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;

/// Who this process is on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub service: String,
    pub node_id: String,
    pub address: String,
}

/// Best-effort pub/sub over the registry. A full broadcast runs local
/// handlers synchronously, then queues one independent push per other
/// known node. Nothing is retried and the sender never learns which pushes
/// landed.
pub struct Broadcaster {
    identity: NodeIdentity,
    registry: Arc<Registry>,
    pusher: Pusher,
    handlers: RwLock<HashMap<String, Vec<MessageHandler>>>,
}

impl Broadcaster {
    pub fn new(identity: NodeIdentity, registry: Arc<Registry>, pusher: Pusher) -> Self {
        Self {
            identity,
            registry,
            pusher,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pusher(&self) -> &Pusher {
        &self.pusher
    }

    /// Add a local handler for `topic`
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Send `payload` on `topic`.
    ///
    /// With an empty `target` the message is delivered to local handlers
    /// first, then pushed to every other node of every service. With a
    /// target it is pushed only to that service's nodes and not applied
    /// locally. Returns the number of pushes queued.
    pub async fn send(&self, topic: &str, payload: Value, target: &str) -> usize {
        let message = BroadcastMessage {
            topic: topic.to_string(),
            service: self.identity.service.clone(),
            node_id: self.identity.node_id.clone(),
            target: target.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        if target.is_empty() {
            self.dispatch_local(&message);
        }

        let addresses = match self.plan(target).await {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::warn!("Broadcast on {} not pushed, registry lookup failed: {}", topic, e);
                return 0;
            }
        };

        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Broadcast on {} not pushed: {}", topic, e);
                return 0;
            }
        };

        let mut queued = 0;
        for address in addresses {
            let job = PushJob {
                url: node_url(&address, BROADCAST_PATH),
                body: body.clone(),
            };
            if self.pusher.push(job) {
                queued += 1;
            }
        }
        tracing::debug!("Broadcast on {} queued to {} node(s)", topic, queued);
        queued
    }

    /// Addresses a send with `target` would push to. The sending node is
    /// never included.
    pub async fn plan(&self, target: &str) -> Result<Vec<String>, RegistryError> {
        let records = if target.is_empty() {
            self.registry.list_services().await?
        } else {
            vec![self.registry.get_service(target).await?]
        };

        let mut seen = HashSet::new();
        let mut addresses = Vec::new();
        for node in records.iter().flat_map(|r| r.nodes.iter()) {
            if node.id == self.identity.node_id {
                continue;
            }
            if seen.insert(node.id.as_str()) {
                addresses.push(node.address.clone());
            }
        }
        Ok(addresses)
    }

    /// Inbound path: dispatch if the message is untargeted or aimed at this
    /// service, drop it otherwise. Returns whether it was dispatched.
    pub fn handle_inbound(&self, message: BroadcastMessage) -> bool {
        if !message.target.is_empty() && message.target != self.identity.service {
            tracing::debug!(
                "Dropping broadcast on {} aimed at {}",
                message.topic,
                message.target
            );
            return false;
        }
        self.dispatch_local(&message);
        true
    }

    fn dispatch_local(&self, message: &BroadcastMessage) -> usize {
        // Handlers run outside the lock so they may subscribe themselves
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use shared::types::{Node, ServiceRecord};
    use crate::config::BroadcastConfig;

    pub(crate) fn node(id: &str, address: &str) -> Node {
        Node {
            id: id.to_string(),
            address: address.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Broadcaster for node `self-1` of service `self`, with pushes going
    /// nowhere reachable.
    pub(crate) async fn test_broadcaster() -> Arc<Broadcaster> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(Registry::in_memory(Duration::from_secs(30), cancel.clone()));
        registry
            .register(ServiceRecord::new(
                "self",
                "1",
                vec![node("self-1", "127.0.0.1:1"), node("self-2", "127.0.0.1:2")],
            ))
            .await
            .unwrap();
        registry
            .register(ServiceRecord::new("other", "1", vec![node("other-1", "127.0.0.1:3")]))
            .await
            .unwrap();
        registry.shutdown();

        let config = BroadcastConfig {
            push_timeout_ms: 100,
            workers: 1,
            queue_capacity: 64,
        };
        let identity = NodeIdentity {
            service: "self".to_string(),
            node_id: "self-1".to_string(),
            address: "127.0.0.1:1".to_string(),
        };
        Arc::new(Broadcaster::new(identity, registry, Pusher::spawn(&config, cancel)))
    }

    fn inbound(topic: &str, target: &str) -> BroadcastMessage {
        BroadcastMessage {
            topic: topic.to_string(),
            service: "other".to_string(),
            node_id: "other-1".to_string(),
            target: target.to_string(),
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    fn counter(broadcaster: &Broadcaster, topic: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        broadcaster.subscribe(topic, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let broadcaster = test_broadcaster().await;
        let a = counter(&broadcaster, "A");
        let b = counter(&broadcaster, "B");

        for payload in [Value::Null, Value::from(1), Value::from("x")] {
            broadcaster.send("B", payload.clone(), "").await;
            broadcaster.handle_inbound(BroadcastMessage {
                payload,
                ..inbound("B", "")
            });
        }

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_full_broadcast_excludes_self() {
        let broadcaster = test_broadcaster().await;
        let local = counter(&broadcaster, "t");

        let mut plan = broadcaster.plan("").await.unwrap();
        plan.sort();
        assert_eq!(plan, vec!["127.0.0.1:2".to_string(), "127.0.0.1:3".to_string()]);

        let queued = broadcaster.send("t", Value::Null, "").await;
        assert_eq!(queued, 2);
        assert_eq!(local.load(Ordering::SeqCst), 1, "Local delivery happens exactly once");
    }

    #[tokio::test]
    async fn test_targeted_send_skips_local_handlers() {
        let broadcaster = test_broadcaster().await;
        let local = counter(&broadcaster, "t");

        assert_eq!(broadcaster.plan("other").await.unwrap(), vec!["127.0.0.1:3".to_string()]);
        assert_eq!(broadcaster.send("t", Value::Null, "other").await, 1);
        assert_eq!(local.load(Ordering::SeqCst), 0);

        // Unknown target: nothing pushed, nothing raised
        assert_eq!(broadcaster.send("t", Value::Null, "missing").await, 0);
    }

    #[tokio::test]
    async fn test_inbound_target_filter() {
        let broadcaster = test_broadcaster().await;
        let local = counter(&broadcaster, "t");

        assert!(broadcaster.handle_inbound(inbound("t", "")));
        assert!(broadcaster.handle_inbound(inbound("t", "self")));
        assert!(!broadcaster.handle_inbound(inbound("t", "other")));
        assert_eq!(local.load(Ordering::SeqCst), 2);
    }
}
