use std::sync::Arc;
use std::time::Duration;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::protocol::BROADCAST_PATH;
use shared::types::{
    BroadcastMessage, KvKeyRequest, KvSetRequest, PublishRequest, SubscribeRequest, Subscription,
};
use crate::broadcast::Broadcaster;
use crate::kv::KvStore;
use crate::relay::Relay;

/// Inbound side of the broadcast bus, mounted by every role
pub fn router(broadcaster: Arc<Broadcaster>) -> Router {
    Router::new()
        .route(BROADCAST_PATH, post(receive_broadcast))
        .with_state(broadcaster)
}

pub fn relay_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/pubsub/subscribe", post(subscribe))
        .route("/pubsub/publish", post(publish))
        .route("/pubsub/subscribers", get(subscribers))
        .with_state(relay)
}

pub fn kv_router(store: Arc<KvStore>) -> Router {
    Router::new()
        .route("/cache/set", post(kv_set))
        .route("/cache/get", post(kv_get))
        .route("/cache/delete", post(kv_delete))
        .route("/cache/exists", post(kv_exists))
        .route("/cache/clear", post(kv_clear))
        .route("/cache/keys", get(kv_keys))
        .with_state(store)
}

// The body is parsed by hand so a malformed message is a plain 400
async fn receive_broadcast(State(broadcaster): State<Arc<Broadcaster>>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<BroadcastMessage>(&body) {
        Ok(message) => {
            broadcaster.handle_inbound(message);
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!("Rejecting malformed broadcast: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

#[derive(Serialize)]
pub struct PublishResponse {
    pub queued: usize,
}

async fn subscribe(State(relay): State<Arc<Relay>>, Json(request): Json<SubscribeRequest>) -> StatusCode {
    if request.service.is_empty() || request.callback_addr.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    relay.subscribe(request);
    StatusCode::OK
}

async fn publish(
    State(relay): State<Arc<Relay>>,
    Json(request): Json<PublishRequest>,
) -> Json<PublishResponse> {
    Json(PublishResponse {
        queued: relay.publish(&request),
    })
}

async fn subscribers(State(relay): State<Arc<Relay>>) -> Json<Vec<Subscription>> {
    Json(relay.subscribers())
}

#[derive(Serialize)]
pub struct KvValueResponse {
    pub key: String,
    pub value: Value,
}

#[derive(Deserialize)]
pub struct KeysQuery {
    #[serde(default)]
    pub prefix: String,
}

async fn kv_set(State(store): State<Arc<KvStore>>, Json(request): Json<KvSetRequest>) -> StatusCode {
    store.set(&request.key, request.value, Duration::from_secs(request.ttl));
    StatusCode::OK
}

async fn kv_get(
    State(store): State<Arc<KvStore>>,
    Json(request): Json<KvKeyRequest>,
) -> Result<Json<KvValueResponse>, StatusCode> {
    store
        .get(&request.key)
        .map(|value| {
            Json(KvValueResponse {
                key: request.key,
                value,
            })
        })
        .ok_or(StatusCode::NOT_FOUND)
}

async fn kv_delete(State(store): State<Arc<KvStore>>, Json(request): Json<KvKeyRequest>) -> Json<Value> {
    Json(serde_json::json!({ "deleted": store.delete(&request.key) }))
}

async fn kv_exists(State(store): State<Arc<KvStore>>, Json(request): Json<KvKeyRequest>) -> Json<Value> {
    Json(serde_json::json!({ "exists": store.exists(&request.key) }))
}

async fn kv_clear(State(store): State<Arc<KvStore>>) -> Json<Value> {
    Json(serde_json::json!({ "cleared": store.clear() }))
}

async fn kv_keys(State(store): State<Arc<KvStore>>, Query(query): Query<KeysQuery>) -> Json<Vec<String>> {
    Json(store.keys(&query.prefix))
}
