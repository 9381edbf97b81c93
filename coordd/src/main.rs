use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use coordd::api;
use coordd::config::{Config, Role};
use coordd::context::Coordinator;
use coordd::gateway::{self, Gateway};
use coordd::kv::{self, KvStore};
use coordd::relay::{self, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coordd=info"))
        )
        .init();

    tracing::info!("Starting coordd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/coordd/coordd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!(
        "Loaded config from {}: service {} as {:?}",
        config_path,
        config.node.service,
        config.node.role
    );

    let cancel = CancellationToken::new();
    let coordinator = Coordinator::build(config.clone(), cancel.clone()).await?;
    tracing::info!("Node id {}", coordinator.identity().node_id);

    let mut app = api::routes::router(coordinator.broadcaster().clone());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    match config.node.role {
        Role::Service => {}
        Role::Gateway => {
            let gateway = Arc::new(Gateway::new(coordinator.registry().clone(), config.gateway.clone()));
            gateway.attach(coordinator.lifecycle());
            tasks.push(tokio::spawn(
                gateway.clone().run_resync(coordinator.registry().watch(), cancel.clone()),
            ));
            app = app.merge(gateway::router(gateway));
        }
        Role::Relay => {
            let relay = Arc::new(Relay::new(&config.relay, coordinator.broadcaster().pusher().clone()));
            tasks.push(tokio::spawn(relay::run_sweeper(
                relay.clone(),
                Duration::from_secs(config.relay.sweep_interval_secs),
                cancel.clone(),
            )));
            app = app.merge(api::routes::relay_router(relay));
        }
        Role::Cache => {
            let store = Arc::new(KvStore::new());
            tasks.push(tokio::spawn(kv::run_sweeper(
                store.clone(),
                Duration::from_secs(config.kv.sweep_interval_secs),
                cancel.clone(),
            )));
            app = app.merge(api::routes::kv_router(store));
        }
    }

    let listener = tokio::net::TcpListener::bind(&config.node.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.node.listen))?;

    tracing::info!("API listening on {}", config.node.listen);

    // The server stops on its own token so shutdown broadcasts can still be
    // received while the coordinator winds down
    let server_cancel = CancellationToken::new();
    let server_stop = server_cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    coordinator
        .start()
        .await
        .context("Failed to register with the registry")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Emits stopping/stopped, deregisters and cancels background tasks
    coordinator.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }

    server_cancel.cancel();
    let _ = server_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
