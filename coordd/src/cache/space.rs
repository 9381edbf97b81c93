use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::key::CacheKey;
use shared::types::{CacheAction, CacheMessage};
use crate::digest::entries_digest;
use crate::error::CacheError;

pub type CacheHandler = Arc<dyn Fn(CacheMessage) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn boxed<F, Fut>(handler: F) -> CacheHandler
where
    F: Fn(CacheMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| handler(message).boxed())
}

/// One module's key/value mirror inside this process.
///
/// Values are stored serialized. Direct `set`/`delete`/`clear` touch only
/// this mirror and raise no events; replicated changes arrive through
/// [`apply`](Self::apply).
pub struct CacheSpace {
    module: String,
    entries: RwLock<HashMap<String, String>>,
    key_handlers: RwLock<HashMap<String, Vec<CacheHandler>>>,
    any_handlers: RwLock<Vec<CacheHandler>>,
}

impl CacheSpace {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            entries: RwLock::new(HashMap::new()),
            key_handlers: RwLock::new(HashMap::new()),
            any_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn get<T: DeserializeOwned>(&self, key: impl CacheKey) -> Result<Option<T>, CacheError> {
        match self.get_raw(key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_raw(&self, key: impl CacheKey) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.to_key())
            .cloned()
    }

    pub fn set<T: Serialize>(&self, key: impl CacheKey, value: &T) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.set_raw(key, payload);
        Ok(())
    }

    pub fn set_raw(&self, key: impl CacheKey, payload: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_key(), payload);
    }

    pub fn delete(&self, key: impl CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.to_key())
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn contains(&self, key: impl CacheKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key.to_key())
    }

    /// Keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content digest for comparing mirrors across processes
    pub fn digest(&self) -> String {
        entries_digest(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Handler for changes to one key
    pub fn on_key<F, Fut>(&self, key: impl CacheKey, handler: F)
    where
        F: Fn(CacheMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.key_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_key())
            .or_default()
            .push(boxed(handler));
    }

    /// Handler for any change in this module
    pub fn on_change<F, Fut>(&self, handler: F)
    where
        F: Fn(CacheMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_any_handler(boxed(handler));
    }

    pub(crate) fn add_any_handler(&self, handler: CacheHandler) {
        self.any_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Apply a replicated change and raise key and module handlers, each on
    /// its own task. The last applied message wins; applying the same
    /// message twice leaves the same contents. Returns the number of
    /// handlers raised.
    pub fn apply(&self, message: &CacheMessage) -> usize {
        match message.action {
            CacheAction::Set => self.set_raw(message.key.as_str(), message.payload.clone()),
            CacheAction::Delete => {
                self.delete(message.key.as_str());
            }
            CacheAction::Clear => self.clear(),
        }

        let mut handlers: Vec<CacheHandler> = Vec::new();
        if message.action != CacheAction::Clear {
            if let Some(for_key) = self
                .key_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&message.key)
            {
                handlers.extend(for_key.iter().cloned());
            }
        }
        handlers.extend(
            self.any_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );

        for handler in &handlers {
            tokio::spawn(handler(message.clone()));
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use chrono::Utc;
    use serde::Deserialize;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Role {
        id: u64,
        perms: Vec<String>,
    }

    fn message(action: CacheAction, key: &str, payload: &str) -> CacheMessage {
        CacheMessage {
            service: "auth-svc".to_string(),
            module: "rbac".to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
            action,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_typed_get_set_with_integer_keys() {
        let space = CacheSpace::new("rbac");
        let role = Role {
            id: 7,
            perms: vec!["user:read".to_string()],
        };

        space.set(7u64, &role).unwrap();
        assert!(space.contains("7"));
        assert_eq!(space.get::<Role>(7i64).unwrap(), Some(role));
        assert_eq!(space.get::<Role>(8u64).unwrap(), None);

        space.set_raw("bad", "not json".to_string());
        assert!(space.get::<Role>("bad").is_err());
        assert_eq!(space.keys(), vec!["7".to_string(), "bad".to_string()]);
    }

    #[tokio::test]
    async fn test_replayed_set_is_idempotent() {
        let space = CacheSpace::new("rbac");
        let msg = message(CacheAction::Set, "admin", "[\"*\"]");

        space.apply(&msg);
        let once = (space.keys(), space.get_raw("admin"), space.digest());
        space.apply(&msg);
        let twice = (space.keys(), space.get_raw("admin"), space.digest());

        assert_eq!(once, twice);
        assert_eq!(space.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let space = CacheSpace::new("rbac");
        space.apply(&message(CacheAction::Set, "a", "1"));
        space.apply(&message(CacheAction::Set, "b", "2"));

        space.apply(&message(CacheAction::Delete, "a", ""));
        assert_eq!(space.keys(), vec!["b".to_string()]);

        // Deleting an absent key is harmless
        space.apply(&message(CacheAction::Delete, "a", ""));

        space.apply(&message(CacheAction::Clear, "", ""));
        assert!(space.is_empty());
    }

    #[tokio::test]
    async fn test_key_and_module_handlers() {
        let space = CacheSpace::new("rbac");
        let (key_tx, mut key_rx) = mpsc::unbounded_channel();
        space.on_key("admin", move |msg| {
            let tx = key_tx.clone();
            async move {
                let _ = tx.send(msg.key);
            }
        });
        let (any_tx, mut any_rx) = mpsc::unbounded_channel();
        space.on_change(move |msg| {
            let tx = any_tx.clone();
            async move {
                let _ = tx.send(msg.action);
            }
        });

        assert_eq!(space.apply(&message(CacheAction::Set, "admin", "1")), 2);
        assert_eq!(space.apply(&message(CacheAction::Set, "guest", "1")), 1);
        assert_eq!(space.apply(&message(CacheAction::Clear, "", "")), 1);

        let wait = Duration::from_secs(1);
        assert_eq!(tokio::time::timeout(wait, key_rx.recv()).await.unwrap().unwrap(), "admin");
        let mut actions = Vec::new();
        for _ in 0..3 {
            actions.push(tokio::time::timeout(wait, any_rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(actions.iter().filter(|a| **a == CacheAction::Set).count(), 2);
        assert!(actions.contains(&CacheAction::Clear));
        assert!(key_rx.try_recv().is_err());
    }
}
