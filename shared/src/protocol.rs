/// Key prefix for service records in a shared registry store
pub const REGISTRY_KEY_PREFIX: &str = "registry:service:";

/// Default record TTL in seconds
pub const DEFAULT_TTL_SECS: u64 = 30;

/// Heartbeats re-write a record every `ttl / HEARTBEAT_DIVISOR`
pub const HEARTBEAT_DIVISOR: u32 = 3;

/// Node metadata keys used by the gateway
pub const META_BASE_PATH: &str = "base_path";
pub const META_ROUTES: &str = "routes";

/// Callback path every coordinating process exposes for inbound pushes
pub const BROADCAST_PATH: &str = "/_broadcast";

/// Well-known broadcast topics
pub const LIFECYCLE_TOPIC: &str = "lifecycle";
pub const CACHE_TOPIC: &str = "cache";

/// API path prefix
pub const API_PREFIX: &str = "/api/v1";

/// Methods a derived route accepts when no explicit list is given
pub const DEFAULT_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Matches any service or module in a cache subscription filter
pub const WILDCARD: &str = "*";
