use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{PublishRequest, SubscribeRequest, Subscription};
use crate::broadcast::{node_url, PushJob, Pusher};
use crate::config::RelayConfig;

struct Entry {
    callback_addr: String,
    topics: BTreeSet<String>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
}

/// Standalone message relay. Services register a callback address and a
/// topic set; a publish is pushed to every other subscriber of the topic
/// through the shared push pool. Subscriptions that are not refreshed
/// expire.
pub struct Relay {
    subscriptions: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    pusher: Pusher,
}

impl Relay {
    pub fn new(config: &RelayConfig, pusher: Pusher) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.subscription_ttl_secs),
            pusher,
        }
    }

    /// Upsert the subscription of `request.service` and refresh its last-seen time
    pub fn subscribe(&self, request: SubscribeRequest) {
        let entry = Entry {
            callback_addr: request.callback_addr,
            topics: request.topics.into_iter().collect(),
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
        };
        tracing::info!(
            "{} subscribed to {} topic(s) at {}",
            request.service,
            entry.topics.len(),
            entry.callback_addr
        );
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.service, entry);
    }

    /// Queue `request` to every live subscriber of its topic except the
    /// sender. Returns the number of pushes queued.
    pub fn publish(&self, request: &PublishRequest) -> usize {
        let body = match serde_json::to_string(request) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Publish on {} dropped: {}", request.topic, e);
                return 0;
            }
        };

        let targets: Vec<String> = {
            let now = Instant::now();
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscriptions
                .iter()
                .filter(|(service, entry)| {
                    **service != request.sender
                        && entry.topics.contains(&request.topic)
                        && !self.is_expired(entry, now)
                })
                .map(|(_, entry)| entry.callback_addr.clone())
                .collect()
        };

        let mut queued = 0;
        for address in targets {
            let job = PushJob {
                url: node_url(&address, ""),
                body: body.clone(),
            };
            if self.pusher.push(job) {
                queued += 1;
            }
        }
        tracing::debug!("Publish on {} from {} queued to {}", request.topic, request.sender, queued);
        queued
    }

    /// Live subscriptions, by service name
    pub fn subscribers(&self) -> Vec<Subscription> {
        let now = Instant::now();
        let mut list: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(service, entry)| Subscription {
                service: service.clone(),
                callback_addr: entry.callback_addr.clone(),
                topics: entry.topics.clone(),
                last_seen_at: entry.last_seen_at,
            })
            .collect();
        list.sort_by(|a, b| a.service.cmp(&b.service));
        list
    }

    /// Drop expired subscriptions. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|service, entry| {
            let keep = !self.is_expired(entry, now);
            if !keep {
                tracing::info!("Subscription of {} expired", service);
            }
            keep
        });
        before - subscriptions.len()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.last_seen) >= self.ttl
    }
}

/// Periodic sweep until `cancel` fires
pub async fn run_sweeper(relay: Arc<Relay>, interval: Duration, cancel: CancellationToken) {
    let mut sweep_interval = tokio::time::interval(interval.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = sweep_interval.tick() => {
                let removed = relay.sweep();
                if removed > 0 {
                    tracing::debug!("Relay sweep removed {} subscription(s)", removed);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Relay sweeper shutting down");
                break;
            }
        }
    }
}
