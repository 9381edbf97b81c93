pub mod breaker;
pub mod proxy;
pub mod route;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Response},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use shared::types::{LifecycleEvent, Node, ServiceRecord, WatchAction};
use crate::config::GatewayConfig;
use crate::digest::records_digest;
use crate::error::{GatewayError, RegistryError};
use crate::lifecycle::LifecycleManager;
use crate::registry::{Registry, RegistryWatch};

pub use breaker::{CircuitBreaker, CircuitState};
pub use proxy::{upstream_url, Forwarded, Proxy};
pub use route::{derive_routes, rewrite_path, RouteEntry, RouteMatch, RouteOrigin, RouteTable};

static SELECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Naive load spread: the clock plus a per-process call counter, so a
/// coarse clock still moves between calls. Not strict round robin and not
/// aware of failing nodes.
pub fn select_node(nodes: &[Node]) -> Option<&Node> {
    if nodes.is_empty() {
        return None;
    }
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as usize;
    let calls = SELECTIONS.fetch_add(1, Ordering::Relaxed);
    nodes.get(micros.wrapping_add(calls) % nodes.len())
}

fn has_bearer(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !token.trim().is_empty())
}

pub struct Gateway {
    registry: Arc<Registry>,
    config: GatewayConfig,
    routes: RwLock<RouteTable>,
    /// Digest of the last scan the table was built from
    last_digest: RwLock<Option<String>>,
    breakers: StdRwLock<HashMap<String, Arc<CircuitBreaker>>>,
    proxy: Proxy,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, config: GatewayConfig) -> Self {
        let proxy = Proxy::new(
            Duration::from_secs(config.proxy_timeout_secs),
            config.max_body_bytes,
        );
        Self {
            registry,
            config,
            routes: RwLock::new(RouteTable::new()),
            last_digest: RwLock::new(None),
            breakers: StdRwLock::new(HashMap::new()),
            proxy,
        }
    }

    /// Rebuild the table from a full scan. Returns false when the scan is
    /// identical to the one the table already reflects.
    pub async fn full_scan(&self) -> Result<bool, RegistryError> {
        let records = self.registry.list_services().await?;
        let digest = records_digest(&records);

        let mut last = self.last_digest.write().await;
        if last.as_deref() == Some(digest.as_str()) {
            return Ok(false);
        }

        let table = RouteTable::from_records(&records, &self.config.api_prefix);
        let count = table.len();
        *self.routes.write().await = table;
        tracing::info!(
            "Route table rebuilt from {} service(s): {} route(s), digest {}",
            records.len(),
            count,
            &digest[..12]
        );
        *last = Some(digest);
        Ok(true)
    }

    /// Targeted refresh of one service's routes
    pub async fn register_service(&self, name: &str) -> Result<(), RegistryError> {
        let record = self.registry.get_service(name).await?;
        self.apply_record(&record).await;
        Ok(())
    }

    pub async fn apply_record(&self, record: &ServiceRecord) {
        let entries = derive_routes(record, &self.config.api_prefix);
        let count = entries.len();
        self.routes.write().await.replace_service(&record.name, entries);
        // The table no longer matches the last scan
        *self.last_digest.write().await = None;
        tracing::info!("Routes for {} refreshed: {} route(s)", record.name, count);
    }

    pub async fn routes(&self) -> Vec<RouteEntry> {
        self.routes.read().await.entries().to_vec()
    }

    pub async fn digest(&self) -> Option<String> {
        self.last_digest.read().await.clone()
    }

    /// Breaker for one downstream address, created on first use
    pub fn breaker(&self, address: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
        {
            return breaker.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.failure_threshold,
                    Duration::from_secs(self.config.open_timeout_secs),
                ))
            })
            .clone()
    }

    fn breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(address, b)| (address.clone(), b.state()))
            .collect()
    }

    /// Route, pick a node and proxy one request
    pub async fn handle(
        &self,
        request: Request,
        client: Option<SocketAddr>,
    ) -> Result<Response<Body>, GatewayError> {
        let path = request.uri().path().to_string();
        let method = request.method().as_str().to_string();

        let entry = match self.routes.read().await.lookup(&path, &method) {
            RouteMatch::Found(entry) => entry.clone(),
            RouteMatch::MethodNotAllowed(_) => return Err(GatewayError::MethodNotAllowed(method)),
            RouteMatch::NotFound => return Err(GatewayError::RouteNotFound(path)),
        };

        if entry.auth_required && !has_bearer(request.headers()) {
            return Err(GatewayError::Unauthorized);
        }

        let record = match self.registry.get_service(&entry.service_name).await {
            Ok(record) => record,
            Err(RegistryError::NotFound(_)) => {
                return Err(GatewayError::NoHealthyNode(entry.service_name));
            }
            Err(e) => {
                tracing::warn!("Lookup of {} failed: {}", entry.service_name, e);
                return Err(GatewayError::NoHealthyNode(entry.service_name));
            }
        };
        let node = select_node(&record.nodes)
            .ok_or_else(|| GatewayError::NoHealthyNode(entry.service_name.clone()))?;

        let breaker = self.breaker(&node.address);
        if !breaker.allow() {
            return Err(GatewayError::CircuitOpen(node.address.clone()));
        }

        let url = upstream_url(
            &node.address,
            &rewrite_path(&entry, &path),
            request.uri().query(),
        );
        let forwarded = Forwarded {
            client,
            host: request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            prefix: entry.path_prefix.clone(),
        };

        tracing::debug!("{} {} -> {}", method, path, url);
        match self.proxy.forward(request, &node.address, &url, &forwarded).await {
            Ok(response) => {
                if response.status().is_server_error() {
                    breaker.failure();
                } else {
                    breaker.success();
                }
                Ok(response)
            }
            Err(e @ GatewayError::Upstream { .. }) => {
                tracing::warn!("Proxy to {} failed: {}", node.address, e);
                breaker.failure();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh on `ready`, log on `stopping`
    pub fn attach(self: &Arc<Self>, lifecycle: &LifecycleManager) {
        let gateway = self.clone();
        lifecycle.on_service_ready(move |message| {
            let gateway = gateway.clone();
            async move {
                if let Err(e) = gateway.register_service(&message.service).await {
                    tracing::warn!("Refresh of {} after ready failed: {}", message.service, e);
                }
            }
        });
        lifecycle.on_event(LifecycleEvent::Stopping, |message| async move {
            tracing::info!(
                "{} node {} stopping, routes kept until next scan",
                message.service,
                message.node_id
            );
        });
    }

    /// Periodic full scans (the first one immediately) plus registry watch
    /// events, until `cancel` fires.
    pub async fn run_resync(self: Arc<Self>, mut watch: RegistryWatch, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.resync_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.full_scan().await {
                        tracing::warn!("Route resync failed, keeping current table: {}", e);
                    }
                }
                event = watch.next() => match event {
                    Some(event) => match event.action {
                        WatchAction::Create | WatchAction::Update => self.apply_record(&event.record).await,
                        WatchAction::Delete => {
                            if let Err(e) = self.full_scan().await {
                                tracing::warn!("Route resync failed, keeping current table: {}", e);
                            }
                        }
                    },
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Gateway resync stopped");
    }
}

#[derive(Serialize)]
struct RoutesResponse {
    digest: Option<String>,
    routes: Vec<RouteEntry>,
    breakers: BTreeMap<String, CircuitState>,
}

async fn get_routes(State(gateway): State<Arc<Gateway>>) -> Json<RoutesResponse> {
    Json(RoutesResponse {
        digest: gateway.digest().await,
        routes: gateway.routes().await,
        breakers: gateway.breaker_states(),
    })
}

async fn proxy_request(
    State(gateway): State<Arc<Gateway>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response<Body> {
    match gateway.handle(request, connect.map(|c| c.0)).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Discovery-driven reverse proxy: admin view plus the catch-all.
///
/// The route table is derived state. A full registry scan rebuilds it from
/// scratch, while `ready` lifecycle events or registry watch events patch
/// in a single service between scans. `stopping` never removes routes; the
/// next scan or the record's TTL takes care of that.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/_gateway/routes", get(get_routes))
        .fallback(proxy_request)
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use tower::ServiceExt;

    fn node(id: &str, address: &str, meta: &[(&str, &str)]) -> Node {
        Node {
            id: id.to_string(),
            address: address.to_string(),
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn test_gateway() -> (Arc<Registry>, Arc<Gateway>) {
        let registry = Arc::new(Registry::in_memory(
            Duration::from_secs(30),
            CancellationToken::new(),
        ));
        let gateway = Arc::new(Gateway::new(registry.clone(), GatewayConfig::default()));
        (registry, gateway)
    }

    async fn status_of(gateway: &Arc<Gateway>, method: Method, uri: &str) -> StatusCode {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router(gateway.clone()).oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_select_node_in_range() {
        let nodes = vec![node("a", "x:1", &[]), node("b", "x:2", &[])];
        for _ in 0..50 {
            let picked = select_node(&nodes).unwrap();
            assert!(picked.id == "a" || picked.id == "b");
        }
        assert!(select_node(&[]).is_none());
    }

    #[test]
    fn test_select_node_reaches_every_node() {
        let nodes = vec![node("a", "x:1", &[]), node("b", "x:2", &[])];
        let picked: std::collections::HashSet<&str> = (0..64)
            .map(|_| select_node(&nodes).unwrap().id.as_str())
            .collect();
        assert_eq!(picked.len(), 2, "Both nodes should get traffic");
    }

    #[tokio::test]
    async fn test_oversized_request_body_rejected() {
        let registry = Arc::new(Registry::in_memory(
            Duration::from_secs(30),
            CancellationToken::new(),
        ));
        let config = GatewayConfig {
            max_body_bytes: 4,
            ..GatewayConfig::default()
        };
        let gateway = Arc::new(Gateway::new(registry.clone(), config));
        registry
            .register(ServiceRecord::new(
                "foo",
                "1",
                vec![node("f1", "127.0.0.1:1", &[("base_path", "foo")])],
            ))
            .await
            .unwrap();
        gateway.full_scan().await.unwrap();

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/foo/items")
            .body(Body::from("far more than four bytes"))
            .unwrap();
        let response = router(gateway.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        // The client's mistake does not count against the node
        assert_eq!(gateway.breaker("127.0.0.1:1").state(), CircuitState::Closed);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_full_scan_skips_unchanged() {
        let (registry, gateway) = test_gateway();
        registry
            .register(ServiceRecord::new(
                "dict-svc",
                "1",
                vec![node("d1", "10.0.0.1:9000", &[("base_path", "dicts")])],
            ))
            .await
            .unwrap();

        assert!(gateway.full_scan().await.unwrap());
        assert!(!gateway.full_scan().await.unwrap());

        let routes = gateway.routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path_prefix, "/api/v1/dicts");
        assert!(gateway.digest().await.is_some());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_scanned_route_targets_backend_url() {
        let (registry, gateway) = test_gateway();
        registry
            .register(ServiceRecord::new(
                "a",
                "1",
                vec![node("a1", "10.0.0.1:9000", &[("base_path", "foo")])],
            ))
            .await
            .unwrap();
        gateway.full_scan().await.unwrap();

        let table = gateway.routes.read().await;
        let RouteMatch::Found(entry) = table.lookup("/api/v1/foo/items", "GET") else {
            panic!("route for /api/v1/foo missing");
        };
        let record = registry.get_service(&entry.service_name).await.unwrap();
        let node = select_node(&record.nodes).unwrap();
        assert_eq!(
            upstream_url(&node.address, &rewrite_path(entry, "/api/v1/foo/items"), None),
            "http://10.0.0.1:9000/items"
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_routing_failures() {
        let (registry, gateway) = test_gateway();
        let record = ServiceRecord::new(
            "foo",
            "1",
            vec![node("f1", "127.0.0.1:1", &[("base_path", "foo")])],
        );
        registry.register(record.clone()).await.unwrap();
        gateway.full_scan().await.unwrap();

        assert_eq!(status_of(&gateway, Method::GET, "/api/v1/bar").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&gateway, Method::TRACE, "/api/v1/foo/items").await,
            StatusCode::METHOD_NOT_ALLOWED
        );

        // Route is still in the table but the record is gone
        registry.deregister(&record).await.unwrap();
        assert_eq!(
            status_of(&gateway, Method::GET, "/api/v1/foo/items").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_bad_gateway_then_circuit_opens() {
        let (registry, gateway) = test_gateway();
        registry
            .register(ServiceRecord::new(
                "foo",
                "1",
                vec![node("f1", "127.0.0.1:1", &[("base_path", "foo")])],
            ))
            .await
            .unwrap();
        gateway.full_scan().await.unwrap();

        for _ in 0..GatewayConfig::default().failure_threshold {
            assert_eq!(
                status_of(&gateway, Method::GET, "/api/v1/foo/items").await,
                StatusCode::BAD_GATEWAY
            );
        }
        assert_eq!(gateway.breaker("127.0.0.1:1").state(), CircuitState::Open);
        assert_eq!(
            status_of(&gateway, Method::GET, "/api/v1/foo/items").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_auth_required_route() {
        let (registry, gateway) = test_gateway();
        let routes = r#"[{"path_prefix": "users", "auth_required": true}]"#;
        registry
            .register(ServiceRecord::new(
                "user-svc",
                "1",
                vec![node("u1", "127.0.0.1:1", &[("routes", routes)])],
            ))
            .await
            .unwrap();
        gateway.full_scan().await.unwrap();

        assert_eq!(
            status_of(&gateway, Method::GET, "/api/v1/users/1").await,
            StatusCode::UNAUTHORIZED
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_targeted_refresh_and_admin_view() {
        let (registry, gateway) = test_gateway();
        gateway.full_scan().await.unwrap();
        assert!(gateway.routes().await.is_empty());

        registry
            .register(ServiceRecord::new(
                "log-svc",
                "1",
                vec![node("l1", "10.0.0.9:9000", &[("base_path", "logs")])],
            ))
            .await
            .unwrap();
        gateway.register_service("log-svc").await.unwrap();
        assert!(gateway.digest().await.is_none());
        assert_eq!(gateway.routes().await[0].service_name, "log-svc");

        assert!(matches!(
            gateway.register_service("missing").await,
            Err(RegistryError::NotFound(_))
        ));

        let response = router(gateway.clone())
            .oneshot(axum::http::Request::builder().uri("/_gateway/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["routes"][0]["path_prefix"], "/api/v1/logs");
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_resync_follows_watch_events() {
        let (registry, gateway) = test_gateway();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(gateway.clone().run_resync(registry.watch(), cancel.clone()));

        registry
            .register(ServiceRecord::new(
                "cfg-svc",
                "1",
                vec![node("c1", "10.0.0.3:9000", &[("base_path", "configs")])],
            ))
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if !gateway.routes().await.is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found, "Create event should add routes");

        cancel.cancel();
        task.await.unwrap();
        registry.shutdown();
    }
}
