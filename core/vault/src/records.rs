//! Typed access to the records the vault keeps in its key/value store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use memvault_common::{Error, Result};
use memvault_storage::{ContextId, KeyValueStore, StoreChange};

/// Settings record key.
pub const SETTINGS_KEY: &str = "vault.settings";

/// Session record key.
pub const SESSION_KEY: &str = "vault.session";

/// Usage statistics key.
pub const STATE_KEY: &str = "vault.state";

/// Initialization marker key.
pub const INITIALIZED_KEY: &str = "vault.initialized";

/// Written as the last step of first-time setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializedMarker {
    pub initialized_at: DateTime<Utc>,
}

/// JSON record layer over a shared store.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn KeyValueStore>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read and deserialize a record.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("Record '{}' unreadable: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Read a record as untyped JSON, for schema upgrades.
    pub async fn load_raw(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.load(key).await
    }

    /// Serialize and write a record. Durable when it returns.
    pub async fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store.set(key, bytes).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.remove(key).await
    }

    pub fn context_id(&self) -> &ContextId {
        self.store.context_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}
