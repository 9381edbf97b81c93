use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::protocol::{META_BASE_PATH, META_ROUTES};

/// One running instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Process-unique node id
    pub id: String,

    /// `host:port` other processes dial to reach this node
    pub address: String,

    /// Free-form metadata, e.g. `base_path` and `routes` for the gateway
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A registered service and its live nodes.
/// This is the canonical record stored in the registry and read by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique service name, the registry key
    pub name: String,

    pub version: String,

    /// Ordered node list; a record without nodes is never stored
    pub nodes: Vec<Node>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            nodes,
        }
    }

    /// The advertised base path, taken from the first node that declares one
    pub fn base_path(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find_map(|n| n.metadata.get(META_BASE_PATH))
            .map(String::as_str)
            .filter(|p| !p.trim_matches('/').is_empty())
    }

    /// Route overrides embedded in node metadata. Specs from all nodes are
    /// merged, first occurrence of a prefix wins.
    pub fn route_specs(&self) -> Result<Vec<RouteSpec>, serde_json::Error> {
        let mut specs: Vec<RouteSpec> = Vec::new();
        for node in &self.nodes {
            let Some(raw) = node.metadata.get(META_ROUTES) else {
                continue;
            };
            let parsed: Vec<RouteSpec> = serde_json::from_str(raw)?;
            for spec in parsed {
                if !specs.iter().any(|s| s.path_prefix == spec.path_prefix) {
                    specs.push(spec);
                }
            }
        }
        Ok(specs)
    }
}

/// Fine-grained route override carried in `Node.metadata["routes"]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Path under the gateway API prefix, e.g. `dicts/items`
    pub path_prefix: String,

    /// Path prepended on the backend after stripping
    #[serde(default)]
    pub target_prefix: String,

    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,

    /// Empty means the default method set
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub auth_required: bool,
}

fn default_strip_prefix() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    Create,
    Update,
    Delete,
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub record: ServiceRecord,
}

/// Envelope pushed between processes on `POST /_broadcast`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,

    /// Origin service
    pub service: String,

    /// Origin node
    #[serde(rename = "nodeId")]
    pub node_id: String,

    /// Empty for a full broadcast, otherwise the only service that should act on it
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub payload: Value,

    pub timestamp: DateTime<Utc>,
}

/// Process lifecycle vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Starting,
    Started,
    Ready,
    Stopping,
    Stopped,
    Healthy,
    Unhealthy,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Starting => "starting",
            LifecycleEvent::Started => "started",
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Stopping => "stopping",
            LifecycleEvent::Stopped => "stopped",
            LifecycleEvent::Healthy => "healthy",
            LifecycleEvent::Unhealthy => "unhealthy",
        }
    }

    /// Health events may arrive at any point and carry no ordering
    pub fn is_health(&self) -> bool {
        matches!(self, LifecycleEvent::Healthy | LifecycleEvent::Unhealthy)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(LifecycleEvent::Starting),
            "started" => Ok(LifecycleEvent::Started),
            "ready" => Ok(LifecycleEvent::Ready),
            "stopping" => Ok(LifecycleEvent::Stopping),
            "stopped" => Ok(LifecycleEvent::Stopped),
            "healthy" => Ok(LifecycleEvent::Healthy),
            "unhealthy" => Ok(LifecycleEvent::Unhealthy),
            other => Err(format!("unknown lifecycle event: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleMessage {
    pub service: String,

    #[serde(rename = "nodeId")]
    pub node_id: String,

    pub event: LifecycleEvent,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheAction {
    Set,
    Delete,
    Clear,
}

/// One mutation of a module's cache space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMessage {
    /// Origin service
    pub service: String,

    pub module: String,

    #[serde(default)]
    pub key: String,

    /// Serialized value, empty for delete/clear
    #[serde(default)]
    pub payload: String,

    pub action: CacheAction,

    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /pubsub/subscribe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub service: String,
    pub callback_addr: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Body of `POST /pubsub/publish`, also the body delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub sender: String,
    #[serde(default)]
    pub payload: Value,
}

/// A relay subscription as reported by `GET /pubsub/subscribers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub service: String,
    pub callback_addr: String,
    pub topics: BTreeSet<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Body of `POST /cache/set`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvSetRequest {
    pub key: String,
    pub value: Value,

    /// Seconds; zero means no expiry
    #[serde(default)]
    pub ttl: u64,
}

/// Body of `POST /cache/get|delete|exists`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvKeyRequest {
    pub key: String,
}
