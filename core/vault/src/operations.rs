//! Export and import of capsules through the encrypted container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::capsules::{Capsule, CapsuleStore};
use crate::manager::SessionStateManager;
use memvault_common::{Error, Result, SensitiveBytes, VaultId};
use memvault_crypto::{offload, ContainerCodec, PayloadSchema};

/// Export payload schema.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Most capsules a single export may carry.
pub const MAX_EXPORT_CAPSULES: usize = 100_000;

/// Plaintext payload of an export container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VaultExport {
    pub schema_version: u32,
    pub vault_id: VaultId,
    pub exported_at: DateTime<Utc>,
    pub capsules: Vec<Capsule>,
}

impl VaultExport {
    pub fn new(vault_id: VaultId, capsules: Vec<Capsule>) -> Self {
        Self {
            schema_version: EXPORT_SCHEMA_VERSION,
            vault_id,
            exported_at: Utc::now(),
            capsules,
        }
    }
}

impl PayloadSchema for VaultExport {
    fn validate(&self) -> Result<()> {
        if self.schema_version != EXPORT_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported export schema version {}",
                self.schema_version
            )));
        }
        if self.capsules.len() > MAX_EXPORT_CAPSULES {
            return Err(Error::InvalidInput("Too many capsules in export".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.capsules.len());
        for capsule in &self.capsules {
            capsule.validate()?;
            if !seen.insert(capsule.id) {
                return Err(Error::InvalidInput(format!("Duplicate capsule {}", capsule.id)));
            }
        }
        Ok(())
    }
}

/// Result of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: usize,
}

/// Export/import handler.
///
/// Key derivation and encryption run through [`offload`], so neither
/// direction blocks the async executor. The container layout does not
/// record an iteration count, so containers always use the standard
/// parameters whatever the vault's own `kdfIterations` is.
#[derive(Clone)]
pub struct VaultOperations {
    manager: Arc<SessionStateManager>,
    capsules: CapsuleStore,
    codec: ContainerCodec,
}

impl VaultOperations {
    pub fn new(manager: Arc<SessionStateManager>, capsules: CapsuleStore) -> Self {
        Self {
            manager,
            capsules,
            codec: ContainerCodec::default(),
        }
    }

    /// Encrypt every capsule into a container.
    ///
    /// # Preconditions
    /// - The vault holds a passphrase-derived key
    /// - `passphrase` is the vault passphrase
    ///
    /// # Errors
    /// - `VaultLocked` without a live key, including session-only unlocks
    /// - `InvalidPassphrase` if the passphrase does not verify
    pub async fn export(&self, passphrase: &SensitiveBytes) -> Result<Vec<u8>> {
        self.manager.require_key()?;
        self.manager.verify_passphrase(passphrase).await?;

        let capsules = self.capsules.list().await?;
        let count = capsules.len();
        let payload = VaultExport::new(self.manager.config().vault_id.clone(), capsules);

        let codec = self.codec.clone();
        let passphrase = passphrase.clone();
        let (bytes, method) = offload(move || codec.encode(&payload, passphrase.as_bytes())).await?;

        info!(
            capsules = count,
            bytes = bytes.len(),
            method = method.as_str(),
            "Vault exported"
        );
        Ok(bytes)
    }

    /// Decrypt a container and merge its capsules by id.
    ///
    /// Existing capsules win; incoming duplicates are counted as skipped.
    ///
    /// # Errors
    /// - `VaultLocked` while locked
    /// - `CorruptContainer` for bytes that are not a container
    /// - `InvalidPassphrase` for every failure after the header check
    pub async fn import(&self, bytes: &[u8], passphrase: &SensitiveBytes) -> Result<ImportSummary> {
        if !self.manager.is_unlocked() {
            return Err(Error::VaultLocked);
        }
        ContainerCodec::peek_header(bytes)?;

        let codec = self.codec.clone();
        let container = bytes.to_vec();
        let passphrase = passphrase.clone();
        let (export, _) = offload(move || {
            codec.decode::<VaultExport>(&container, passphrase.as_bytes())
        })
        .await?;

        if export.vault_id != self.manager.config().vault_id {
            debug!(source = %export.vault_id, "Importing capsules from another vault");
        }

        let (added, skipped) = self.capsules.merge(export.capsules).await?;
        info!(added, skipped, "Vault imported");
        Ok(ImportSummary { added, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export_of(capsules: Vec<Capsule>) -> VaultExport {
        VaultExport::new(VaultId::new("v").unwrap(), capsules)
    }

    #[test]
    fn test_schema_accepts_valid() {
        let export = export_of(vec![Capsule::text("a", "b"), Capsule::text("c", "d")]);
        assert!(export.validate().is_ok());
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        let capsule = Capsule::text("a", "b");
        let export = export_of(vec![capsule.clone(), capsule]);
        assert!(export.validate().is_err());
    }

    #[test]
    fn test_schema_rejects_version() {
        let mut export = export_of(vec![]);
        export.schema_version = 2;
        assert!(export.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut value = serde_json::to_value(export_of(vec![])).unwrap();
        value["extra"] = serde_json::json!(true);
        assert!(serde_json::from_value::<VaultExport>(value).is_err());
    }
}
