//! Memory capsules and the lock-gated capsule store.
//!
//! The security core does not interpret capsule content. This store keeps
//! capsules in memory for the lifetime of the process and refuses every
//! access while the vault is locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use memvault_common::{Error, Result};

/// Longest accepted title, in bytes.
pub const MAX_TITLE_LEN: usize = 512;

/// Largest accepted body or attachment, in bytes.
pub const MAX_CONTENT_LEN: usize = 16 * 1024 * 1024;

/// Anything that can answer "is the vault unlocked right now".
pub trait UnlockGate: Send + Sync {
    fn is_unlocked(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CapsuleContent {
    Text {
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    Attachment {
        mime_type: String,
        #[serde(with = "memvault_crypto::encoding::b64")]
        data: Vec<u8>,
    },
}

impl CapsuleContent {
    fn len(&self) -> usize {
        match self {
            CapsuleContent::Text { body } => body.len(),
            CapsuleContent::Attachment { data, .. } => data.len(),
        }
    }
}

/// One saved memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capsule {
    pub id: Uuid,
    pub title: String,
    pub content: CapsuleContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Capsule {
    pub fn text(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: CapsuleContent::Text { body: body.into() },
            source_url: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::InvalidInput("Capsule id cannot be nil".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(Error::InvalidInput("Capsule title cannot be empty".to_string()));
        }
        if self.title.len() > MAX_TITLE_LEN {
            return Err(Error::InvalidInput(format!(
                "Capsule title longer than {} bytes",
                MAX_TITLE_LEN
            )));
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(Error::InvalidInput("Capsule content too large".to_string()));
        }
        if let CapsuleContent::Attachment { mime_type, .. } = &self.content {
            if !mime_type.contains('/') {
                return Err(Error::InvalidInput(format!("Invalid MIME type '{}'", mime_type)));
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::InvalidInput("Capsule tags cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Capsules keyed by id, reachable only while unlocked.
#[derive(Clone)]
pub struct CapsuleStore {
    gate: Arc<dyn UnlockGate>,
    capsules: Arc<RwLock<BTreeMap<Uuid, Capsule>>>,
}

impl CapsuleStore {
    pub fn new(gate: Arc<dyn UnlockGate>) -> Self {
        Self {
            gate,
            capsules: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    fn check(&self) -> Result<()> {
        if self.gate.is_unlocked() {
            Ok(())
        } else {
            Err(Error::VaultLocked)
        }
    }

    /// Insert or replace a capsule.
    pub async fn put(&self, capsule: Capsule) -> Result<()> {
        self.check()?;
        capsule.validate()?;
        debug!(id = %capsule.id, "Capsule stored");
        self.capsules.write().await.insert(capsule.id, capsule);
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<Capsule> {
        self.check()?;
        self.capsules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Capsule {}", id)))
    }

    /// All capsules, oldest first.
    pub async fn list(&self) -> Result<Vec<Capsule>> {
        self.check()?;
        let mut all: Vec<Capsule> = self.capsules.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub async fn remove(&self, id: &Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.capsules.write().await.remove(id).is_some())
    }

    /// Add capsules whose ids are not present. Returns (added, skipped).
    pub async fn merge(&self, incoming: Vec<Capsule>) -> Result<(usize, usize)> {
        self.check()?;
        let mut capsules = self.capsules.write().await;
        let mut added = 0;
        let mut skipped = 0;
        for capsule in incoming {
            if capsules.contains_key(&capsule.id) {
                skipped += 1;
            } else {
                capsules.insert(capsule.id, capsule);
                added += 1;
            }
        }
        Ok((added, skipped))
    }

    /// Drop everything held in memory. Allowed while locked.
    pub async fn purge(&self) -> usize {
        let mut capsules = self.capsules.write().await;
        let count = capsules.len();
        capsules.clear();
        count
    }
}
