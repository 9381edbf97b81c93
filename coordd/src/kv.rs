use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Key/value store behind the cache-service role. Expired keys are
/// invisible as soon as their deadline passes; the sweeper only reclaims
/// their memory.
#[derive(Default)]
pub struct KvStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`. A zero `ttl`, or one too large to represent as a
    /// deadline, never expires.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Slot { value, expires_at });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    /// Returns whether a live key was removed
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some_and(|slot| slot.is_live(now))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let count = slots.len();
        slots.clear();
        count
    }

    /// Live keys starting with `prefix`, sorted
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        before - slots.len()
    }
}

pub async fn run_sweeper(store: Arc<KvStore>, interval: Duration, cancel: CancellationToken) {
    let mut sweep_interval = tokio::time::interval(interval.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = sweep_interval.tick() => {
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!("KV sweep removed {} expired key(s)", removed);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("KV sweeper shutting down");
                break;
            }
        }
    }
}
