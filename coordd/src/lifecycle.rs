use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use shared::protocol::LIFECYCLE_TOPIC;
use shared::types::{LifecycleEvent, LifecycleMessage};
use crate::broadcast::Broadcaster;

pub type LifecycleHandler = Arc<dyn Fn(LifecycleMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    by_event: RwLock<HashMap<LifecycleEvent, Vec<LifecycleHandler>>>,
    any: RwLock<Vec<LifecycleHandler>>,
}

impl HandlerTable {
    /// Each handler gets its own task so a slow one never holds up the
    /// receive path or its siblings.
    fn dispatch(&self, message: LifecycleMessage) -> usize {
        let mut handlers: Vec<LifecycleHandler> = self
            .by_event
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.event)
            .cloned()
            .unwrap_or_default();
        handlers.extend(
            self.any
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );

        for handler in &handlers {
            tokio::spawn(handler(message.clone()));
        }
        handlers.len()
    }
}

fn boxed<F, Fut>(handler: F) -> LifecycleHandler
where
    F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| handler(message).boxed())
}

/// Fixed-vocabulary lifecycle events on the broadcast bus.
///
/// Arrival order across processes usually follows
/// `starting -> started -> ready -> stopping -> stopped`, but the bus does
/// not promise it and nothing here enforces it.
pub struct LifecycleManager {
    broadcaster: Arc<Broadcaster>,
    handlers: Arc<HandlerTable>,
}

impl LifecycleManager {
    /// Attach to the lifecycle topic of `broadcaster`
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        let handlers = Arc::new(HandlerTable::default());

        let table = handlers.clone();
        broadcaster.subscribe(LIFECYCLE_TOPIC, move |envelope| {
            match serde_json::from_value::<LifecycleMessage>(envelope.payload.clone()) {
                Ok(message) => {
                    tracing::debug!(
                        "Lifecycle {} from {}/{}",
                        message.event,
                        message.service,
                        message.node_id
                    );
                    table.dispatch(message);
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed lifecycle message from {}: {}",
                        envelope.node_id,
                        e
                    );
                }
            }
        });

        Self {
            broadcaster,
            handlers,
        }
    }

    pub fn on_event<F, Fut>(&self, event: LifecycleEvent, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .by_event
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(boxed(handler));
    }

    pub fn on_any_event<F, Fut>(&self, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed(handler));
    }

    pub fn on_service_ready<F, Fut>(&self, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_event(LifecycleEvent::Ready, handler);
    }

    pub fn on_service_stopped<F, Fut>(&self, handler: F)
    where
        F: Fn(LifecycleMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_event(LifecycleEvent::Stopped, handler);
    }

    /// Announce `event` for this process to everyone, itself included.
    /// Returns the number of remote pushes queued.
    pub async fn emit(&self, event: LifecycleEvent, metadata: HashMap<String, String>) -> usize {
        let identity = self.broadcaster.identity();
        let message = LifecycleMessage {
            service: identity.service.clone(),
            node_id: identity.node_id.clone(),
            event,
            timestamp: Utc::now(),
            metadata,
        };

        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Lifecycle {} not emitted: {}", event, e);
                return 0;
            }
        };

        tracing::info!("Emitting lifecycle {} for {}", event, identity.service);
        self.broadcaster.send(LIFECYCLE_TOPIC, payload, "").await
    }
}
