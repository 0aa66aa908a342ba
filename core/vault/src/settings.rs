//! Vault settings: the KDF inputs and the passphrase verifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use memvault_common::{Error, Result};
use memvault_crypto::aead::{open, seal, SealedBox};
use memvault_crypto::kdf::{DerivationMethod, KdfParams, KDF_ALGORITHM};
use memvault_crypto::keys::{MasterKey, Salt, SETTINGS_SALT_LEN};

/// Current settings schema.
pub const SETTINGS_SCHEMA_VERSION: u32 = 2;

/// Plaintext sealed into the verifier.
pub const VERIFIER_SENTINEL: &[u8] = b"MEMVAULT_KEY_VERIFICATION_V1";

/// How long the first derivation took, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfProfile {
    pub method: String,
    pub measured_ms: u64,
    pub device: String,
}

impl KdfProfile {
    pub fn new(method: DerivationMethod, measured_ms: u64, device: impl Into<String>) -> Self {
        Self {
            method: method.as_str().to_string(),
            measured_ms,
            device: device.into(),
        }
    }
}

/// Persisted vault settings.
///
/// `salt` and `iterations` are fixed at creation. Changing either would make
/// every key derived so far unreachable, so nothing in this crate rewrites
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSettings {
    pub schema_version: u32,
    pub kdf: String,
    pub iterations: u32,
    pub salt: Salt,
    pub verifier: Option<SealedBox>,
    pub kdf_profile: Option<KdfProfile>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Settings as written before schema versioning.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySettings {
    kdf: String,
    iterations: u32,
    salt: Salt,
    verifier: Option<SealedBox>,
}

impl VaultSettings {
    /// Fresh settings with a random salt and no verifier.
    pub fn create(params: &KdfParams) -> Self {
        Self {
            schema_version: SETTINGS_SCHEMA_VERSION,
            kdf: KDF_ALGORITHM.to_string(),
            iterations: params.iterations,
            salt: Salt::generate(SETTINGS_SALT_LEN),
            verifier: None,
            kdf_profile: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::with_iterations(self.iterations)
    }

    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    /// Structural checks on a loaded record.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SETTINGS_SCHEMA_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported settings schema version {}",
                self.schema_version
            )));
        }
        if self.kdf != KDF_ALGORITHM {
            return Err(Error::Crypto(format!("Unsupported KDF '{}'", self.kdf)));
        }
        if self.iterations == 0 {
            return Err(Error::Crypto("Settings iteration count is zero".to_string()));
        }
        if self.salt.len() != SETTINGS_SALT_LEN {
            return Err(Error::Crypto(format!(
                "Settings salt must be {} bytes, found {}",
                SETTINGS_SALT_LEN,
                self.salt.len()
            )));
        }
        Ok(())
    }

    /// Parse a stored record, upgrading older schemas.
    ///
    /// Returns the settings and whether an upgrade happened, so the caller
    /// can write the upgraded record back.
    pub fn from_stored(value: serde_json::Value) -> Result<(Self, bool)> {
        let version = value
            .get("schemaVersion")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);

        let (settings, upgraded) = match version {
            1 => {
                let legacy: LegacySettings = serde_json::from_value(value)?;
                let settings = Self {
                    schema_version: SETTINGS_SCHEMA_VERSION,
                    kdf: legacy.kdf,
                    iterations: legacy.iterations,
                    salt: legacy.salt,
                    verifier: legacy.verifier,
                    kdf_profile: None,
                    created_at: None,
                };
                (settings, true)
            }
            v if v == u64::from(SETTINGS_SCHEMA_VERSION) => (serde_json::from_value(value)?, false),
            v => {
                return Err(Error::Serialization(format!(
                    "Settings schema version {} is newer than supported",
                    v
                )))
            }
        };

        settings.validate()?;
        Ok((settings, upgraded))
    }

    /// Seal the sentinel under `key`.
    pub fn seal_verifier(key: &MasterKey) -> Result<SealedBox> {
        seal(key, VERIFIER_SENTINEL)
    }

    /// Check a candidate key against the verifier.
    ///
    /// Both tag authentication and an exact sentinel match are required.
    /// Every failure is `InvalidPassphrase`.
    pub fn check_verifier(&self, key: &MasterKey) -> Result<()> {
        let verifier = self.verifier.as_ref().ok_or(Error::VaultNotInitialized)?;

        let plaintext = open(key, verifier).map_err(|_| Error::InvalidPassphrase)?;
        let matches: bool = plaintext.len() == VERIFIER_SENTINEL.len()
            && bool::from(plaintext.as_slice().ct_eq(VERIFIER_SENTINEL));

        if matches {
            Ok(())
        } else {
            Err(Error::InvalidPassphrase)
        }
    }

    /// Whether `other` keeps the same derivation inputs.
    pub fn same_derivation_inputs(&self, other: &VaultSettings) -> bool {
        self.kdf == other.kdf && self.iterations == other.iterations && self.salt == other.salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memvault_crypto::derive_key;
    use serde_json::json;

    fn params() -> KdfParams {
        KdfParams::with_iterations(1_000)
    }

    #[test]
    fn test_create_has_fresh_salt() {
        let a = VaultSettings::create(&params());
        let b = VaultSettings::create(&params());

        assert_eq!(a.salt.len(), 16);
        assert_ne!(a.salt, b.salt);
        assert!(!a.has_verifier());
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_verifier_accepts_right_key_only() {
        let mut settings = VaultSettings::create(&params());
        let key = derive_key(b"correct horse battery staple", &settings.salt, &params()).unwrap();
        settings.verifier = Some(VaultSettings::seal_verifier(&key).unwrap());

        assert!(settings.check_verifier(&key).is_ok());

        let near_miss = derive_key(b"correct horse battery stapl", &settings.salt, &params()).unwrap();
        assert!(matches!(
            settings.check_verifier(&near_miss),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn test_wrong_sentinel_rejected() {
        let mut settings = VaultSettings::create(&params());
        let key = derive_key(b"pw", &settings.salt, &params()).unwrap();
        settings.verifier = Some(seal(&key, b"SOMETHING_ELSE").unwrap());

        assert!(matches!(settings.check_verifier(&key), Err(Error::InvalidPassphrase)));
    }

    #[test]
    fn test_record_field_names() {
        let settings = VaultSettings::create(&params());
        let value = serde_json::to_value(&settings).unwrap();

        for field in ["schemaVersion", "kdf", "iterations", "salt", "verifier", "kdfProfile"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert!(value["salt"].is_string());
    }

    #[test]
    fn test_legacy_upgrade() {
        let legacy = json!({
            "kdf": "pbkdf2-sha256",
            "iterations": 250000,
            "salt": "AAAAAAAAAAAAAAAAAAAAAA==",
            "verifier": null
        });

        let (settings, upgraded) = VaultSettings::from_stored(legacy).unwrap();
        assert!(upgraded);
        assert_eq!(settings.schema_version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(settings.iterations, 250_000);
    }

    #[test]
    fn test_current_version_not_upgraded() {
        let settings = VaultSettings::create(&params());
        let (loaded, upgraded) =
            VaultSettings::from_stored(serde_json::to_value(&settings).unwrap()).unwrap();
        assert!(!upgraded);
        assert!(loaded.same_derivation_inputs(&settings));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut value = serde_json::to_value(VaultSettings::create(&params())).unwrap();
        value["schemaVersion"] = json!(99);
        assert!(VaultSettings::from_stored(value).is_err());
    }

    #[test]
    fn test_wrong_salt_length_rejected() {
        let mut settings = VaultSettings::create(&params());
        settings.salt = Salt::generate(8);
        assert!(settings.validate().is_err());
    }
}
