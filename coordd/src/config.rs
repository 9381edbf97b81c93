use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{API_PREFIX, DEFAULT_TTL_SECS, REGISTRY_KEY_PREFIX};
use shared::types::RouteSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub kv: KvConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Service,
    Gateway,
    Relay,
    Cache,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub service: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address peers dial; falls back to `listen`
    #[serde(default)]
    pub advertise: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_push_timeout")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_subscription_ttl")]
    pub subscription_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_kv_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_role() -> Role {
    Role::Service
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_key_prefix() -> String {
    REGISTRY_KEY_PREFIX.to_string()
}

fn default_push_timeout() -> u64 {
    3000
}

fn default_workers() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_api_prefix() -> String {
    API_PREFIX.to_string()
}

fn default_resync_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    30
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_subscription_ttl() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_kv_sweep_interval() -> u64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            ttl_secs: default_ttl(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: default_push_timeout(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            resync_interval_secs: default_resync_interval(),
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            subscription_ttl_secs: default_subscription_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_kv_sweep_interval(),
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }
}

impl BroadcastConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

impl NodeConfig {
    pub fn advertise_addr(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.listen)
    }

    /// Configured node id, or `<hostname>-<8 hex chars>`
    pub fn resolve_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            return id.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "node".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(!config.node.service.is_empty(), "node.service must not be empty");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse("[node]\nservice = \"dict-svc\"\n").unwrap();

        assert_eq!(config.node.role, Role::Service);
        assert_eq!(config.node.advertise_addr(), "0.0.0.0:9000");
        assert_eq!(config.registry.backend, BackendKind::Memory);
        assert_eq!(config.registry.ttl(), Duration::from_secs(30));
        assert_eq!(config.registry.key_prefix, "registry:service:");
        assert_eq!(config.gateway.api_prefix, "/api/v1");
        assert_eq!(config.relay.subscription_ttl_secs, 120);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [node]
            service = "gateway"
            role = "gateway"
            listen = "0.0.0.0:8080"
            advertise = "10.0.0.5:8080"
            node_id = "gw-1"

            [[node.routes]]
            path_prefix = "users/admin"
            methods = ["GET"]
            auth_required = true

            [registry]
            backend = "redis"
            redis_url = "redis://redis:6379"

            [gateway]
            failure_threshold = 3
        "#;
        let config = Config::parse(toml).unwrap();

        assert_eq!(config.node.role, Role::Gateway);
        assert_eq!(config.node.advertise_addr(), "10.0.0.5:8080");
        assert_eq!(config.node.resolve_node_id(), "gw-1");
        assert_eq!(config.node.routes.len(), 1);
        assert_eq!(config.registry.backend, BackendKind::Redis);
        assert_eq!(config.gateway.failure_threshold, 3);
        assert_eq!(config.gateway.open_timeout_secs, 30);
    }

    #[test]
    fn test_generated_node_id_is_unique() {
        let config = Config::parse("[node]\nservice = \"a\"\n").unwrap();
        assert_ne!(config.node.resolve_node_id(), config.node.resolve_node_id());
    }

    #[test]
    fn test_empty_service_rejected() {
        assert!(Config::parse("[node]\nservice = \"\"\n").is_err());
    }
}
