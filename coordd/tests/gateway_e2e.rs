use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use axum::{
    body::Body,
    http::{Request, StatusCode, Uri},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use coordd::config::GatewayConfig;
use coordd::gateway::{self, Gateway};
use coordd::registry::Registry;
use shared::types::{Node, ServiceRecord};

/// Backend that records every path it is asked for
async fn spawn_backend(seen: Arc<Mutex<Vec<String>>>) -> String {
    let app = Router::new().fallback(move |uri: Uri| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(uri.to_string());
            "backend-ok"
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    address
}

#[tokio::test]
async fn test_gateway_proxies_to_registered_backend() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let address = spawn_backend(seen.clone()).await;

    let cancel = CancellationToken::new();
    let registry = Arc::new(Registry::in_memory(Duration::from_secs(30), cancel.clone()));
    registry
        .register(ServiceRecord::new(
            "foo",
            "1.0.0",
            vec![Node {
                id: "foo-1".to_string(),
                address: address.clone(),
                metadata: HashMap::from([("base_path".to_string(), "foo".to_string())]),
            }],
        ))
        .await
        .unwrap();

    let gateway = Arc::new(Gateway::new(registry.clone(), GatewayConfig::default()));
    assert!(gateway.full_scan().await.unwrap());

    let response = gateway::router(gateway.clone())
        .oneshot(
            Request::builder()
                .uri("/api/v1/foo/items?page=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"backend-ok");
    assert_eq!(seen.lock().unwrap().as_slice(), ["/items?page=2".to_string()]);

    let response = gateway::router(gateway)
        .oneshot(Request::builder().uri("/api/v1/foobar").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    cancel.cancel();
}
