//! Key/value store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use memvault_common::{Error, Result};

/// Capacity of the change-notification channel.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Maximum key length.
pub const MAX_KEY_LEN: usize = 96;

/// Identity of one execution context writing to a shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    /// Generate a new unique context id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Set,
    Removed,
}

/// Notification emitted after a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub kind: ChangeKind,
    /// Context that performed the write.
    pub origin: ContextId,
}

/// Durable key/value storage shared by one or more execution contexts.
///
/// # Durability
/// `set` and `remove` must not return `Ok` until the change would survive
/// the process being killed.
///
/// # Notifications
/// Every successful write is broadcast to subscribers of all contexts
/// sharing the backend. Delivery is best-effort: lagging or dropped
/// receivers never cause a write to fail.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Context this handle writes as.
    fn context_id(&self) -> &ContextId;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value durably.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a value. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// List stored keys.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Subscribe to change notifications from every context.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Check that a key is usable by every store implementation.
///
/// Keys are limited to ASCII alphanumerics, `.`, `_` and `-`, must not start
/// with `.`, and are at most [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidInput(format!("Invalid store key length: {}", key.len())));
    }
    if key.starts_with('.') {
        return Err(Error::InvalidInput("Store key cannot start with '.'".to_string()));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidInput(format!("Invalid store key: {}", key)));
    }
    Ok(())
}

/// Publish a change, ignoring the absence of receivers.
pub(crate) fn publish(tx: &broadcast::Sender<StoreChange>, change: StoreChange) {
    let _ = tx.send(change);
}
