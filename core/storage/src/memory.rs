//! In-memory key/value store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::store::{
    publish, validate_key, ChangeKind, ContextId, KeyValueStore, StoreChange,
    CHANGE_CHANNEL_CAPACITY,
};
use memvault_common::{Error, Result};

struct Backend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    changes: broadcast::Sender<StoreChange>,
    available: AtomicBool,
}

/// In-memory store.
///
/// Handles created with [`MemoryStore::new_context`] share one backend but
/// write under their own [`ContextId`], which is how tests model a
/// background controller and a foreground surface using the same storage.
/// Data lives as long as any handle does, so dropping a manager and
/// building a new one on the same backend simulates a process restart.
pub struct MemoryStore {
    backend: Arc<Backend>,
    context: ContextId,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backend: Arc::new(Backend {
                entries: RwLock::new(BTreeMap::new()),
                changes,
                available: AtomicBool::new(true),
            }),
            context: ContextId::new(),
        }
    }

    /// Another handle on the same backend, writing as a different context.
    pub fn new_context(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            context: ContextId::new(),
        }
    }

    /// Make every operation fail with a storage error (or recover).
    pub fn set_available(&self, available: bool) {
        self.backend.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.backend.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Storage("Memory store unavailable".to_string()))
        }
    }

    fn lock_poisoned() -> Error {
        Error::Storage("Memory store lock poisoned".to_string())
    }

    fn notify(&self, key: &str, kind: ChangeKind) {
        publish(
            &self.backend.changes,
            StoreChange {
                key: key.to_string(),
                kind,
                origin: self.context.clone(),
            },
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn context_id(&self) -> &ContextId {
        &self.context
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.check_available()?;

        let entries = self.backend.entries.read().map_err(|_| Self::lock_poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.check_available()?;

        {
            let mut entries = self.backend.entries.write().map_err(|_| Self::lock_poisoned())?;
            entries.insert(key.to_string(), value);
        }

        self.notify(key, ChangeKind::Set);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.check_available()?;

        let existed = {
            let mut entries = self.backend.entries.write().map_err(|_| Self::lock_poisoned())?;
            entries.remove(key).is_some()
        };

        if existed {
            self.notify(key, ChangeKind::Removed);
        }
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let entries = self.backend.entries.read().map_err(|_| Self::lock_poisoned())?;
        Ok(entries.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.backend.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store.set("vault.settings", b"{}".to_vec()).await.unwrap();

        assert_eq!(store.get("vault.settings").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("vault.session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store.set("k", vec![1]).await.unwrap();

        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contexts_share_backend() {
        let controller = MemoryStore::new();
        let popup = controller.new_context();

        controller.set("k", vec![7]).await.unwrap();
        assert_eq!(popup.get("k").await.unwrap(), Some(vec![7]));
        assert_ne!(controller.context_id(), popup.context_id());
    }

    #[tokio::test]
    async fn test_change_notifications_carry_origin() {
        let controller = MemoryStore::new();
        let popup = controller.new_context();
        let mut rx = controller.subscribe();

        popup.set("vault.session", vec![1]).await.unwrap();
        popup.remove("vault.session").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Set);
        assert_eq!(&first.origin, popup.context_id());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Removed);
        assert_eq!(second.key, "vault.session");
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.get("k").await, Err(Error::Storage(_))));
        assert!(matches!(store.set("k", vec![]).await, Err(Error::Storage(_))));

        store.set_available(true);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let store = MemoryStore::new();
        assert!(store.set("../etc", vec![]).await.is_err());
    }
}
