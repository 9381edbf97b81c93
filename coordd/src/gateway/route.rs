use std::collections::BTreeSet;
use serde::Serialize;
use shared::protocol::DEFAULT_METHODS;
use shared::types::{RouteSpec, ServiceRecord};

/// Where a route came from. Explicit metadata outranks a `base_path`
/// default when two services claim the same prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
    BasePath,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub service_name: String,
    pub origin: RouteOrigin,
    pub path_prefix: String,
    pub target_prefix: String,
    pub strip_prefix: bool,
    pub methods: BTreeSet<String>,
    pub auth_required: bool,
}

impl RouteEntry {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.contains(&method.to_ascii_uppercase())
    }
}

pub fn default_methods() -> BTreeSet<String> {
    DEFAULT_METHODS.iter().map(|m| m.to_string()).collect()
}

/// `("/api/v1", "dicts")` -> `/api/v1/dicts`
pub fn join_prefix(api_prefix: &str, path: &str) -> String {
    let api = api_prefix.trim_matches('/');
    let path = path.trim_matches('/');
    match (api.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", path),
        (false, true) => format!("/{}", api),
        (false, false) => format!("/{}/{}", api, path),
    }
}

fn from_spec(service: &str, api_prefix: &str, spec: &RouteSpec) -> RouteEntry {
    let methods = if spec.methods.is_empty() {
        default_methods()
    } else {
        spec.methods.iter().map(|m| m.to_ascii_uppercase()).collect()
    };
    RouteEntry {
        service_name: service.to_string(),
        origin: RouteOrigin::Metadata,
        path_prefix: join_prefix(api_prefix, &spec.path_prefix),
        target_prefix: spec.target_prefix.clone(),
        strip_prefix: spec.strip_prefix,
        methods,
        auth_required: spec.auth_required,
    }
}

/// Routes for one record: a default from `base_path`, then metadata
/// overrides. An override with the default's prefix replaces it.
pub fn derive_routes(record: &ServiceRecord, api_prefix: &str) -> Vec<RouteEntry> {
    let mut routes = Vec::new();

    if let Some(base) = record.base_path() {
        routes.push(RouteEntry {
            service_name: record.name.clone(),
            origin: RouteOrigin::BasePath,
            path_prefix: join_prefix(api_prefix, base),
            target_prefix: String::new(),
            strip_prefix: true,
            methods: default_methods(),
            auth_required: false,
        });
    }

    let specs = match record.route_specs() {
        Ok(specs) => specs,
        Err(e) => {
            tracing::warn!("Ignoring malformed route metadata of {}: {}", record.name, e);
            Vec::new()
        }
    };

    for spec in &specs {
        let entry = from_spec(&record.name, api_prefix, spec);
        match routes.iter_mut().find(|r| r.path_prefix == entry.path_prefix) {
            Some(existing) => *existing = entry,
            None => routes.push(entry),
        }
    }
    routes
}

/// `prefix` matches `path` on a segment boundary
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Backend path for `path` under `entry`
pub fn rewrite_path(entry: &RouteEntry, path: &str) -> String {
    let rest = if entry.strip_prefix && entry.path_prefix != "/" {
        path.strip_prefix(entry.path_prefix.as_str()).unwrap_or(path)
    } else {
        path
    };
    let target = entry.target_prefix.trim_end_matches('/');
    let target = if target.is_empty() || target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };

    let rewritten = if rest.is_empty() || rest.starts_with('/') {
        format!("{}{}", target, rest)
    } else {
        format!("{}/{}", target, rest)
    };
    if rewritten.is_empty() {
        "/".to_string()
    } else {
        rewritten
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteMatch<'a> {
    Found(&'a RouteEntry),
    MethodNotAllowed(&'a RouteEntry),
    NotFound,
}

/// Route table derived from registry records.
///
/// Routes are kept longest-prefix first. When two services claim the same
/// prefix a metadata route displaces a `base_path` default; otherwise the
/// first registered wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from scratch out of a registry scan
    pub fn from_records(records: &[ServiceRecord], api_prefix: &str) -> Self {
        let mut sorted: Vec<&ServiceRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut table = Self::new();
        for record in sorted {
            for entry in derive_routes(record, api_prefix) {
                table.insert(entry);
            }
        }
        table
    }

    /// Add a route. A route with an existing prefix keeps the first
    /// registration unless it belongs to the same service or `entry` is a
    /// metadata route taking over a default.
    pub fn insert(&mut self, entry: RouteEntry) -> bool {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.path_prefix == entry.path_prefix)
        {
            let takes_over =
                existing.origin == RouteOrigin::BasePath && entry.origin == RouteOrigin::Metadata;
            if existing.service_name != entry.service_name && !takes_over {
                tracing::warn!(
                    "Route {} already owned by {}, ignoring {}",
                    entry.path_prefix,
                    existing.service_name,
                    entry.service_name
                );
                return false;
            }
            if takes_over && existing.service_name != entry.service_name {
                tracing::info!(
                    "Route {} taken over from {} by {}",
                    entry.path_prefix,
                    existing.service_name,
                    entry.service_name
                );
            }
            *existing = entry;
            return true;
        }

        self.routes.push(entry);
        // Stable: equal lengths keep insertion order
        self.routes
            .sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        true
    }

    /// Swap every route of `service` for `entries`
    pub fn replace_service(&mut self, service: &str, entries: Vec<RouteEntry>) {
        self.routes.retain(|r| r.service_name != service);
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn lookup(&self, path: &str, method: &str) -> RouteMatch<'_> {
        match self.routes.iter().find(|r| prefix_matches(&r.path_prefix, path)) {
            Some(entry) if entry.allows(method) => RouteMatch::Found(entry),
            Some(entry) => RouteMatch::MethodNotAllowed(entry),
            None => RouteMatch::NotFound,
        }
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
