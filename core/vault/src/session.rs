//! Persisted session records.
//!
//! A session record lets the vault report itself unlocked after the host
//! process is killed and restarted, without asking for the passphrase
//! again. It holds a random token and a device fingerprint, never the key
//! or the passphrase, so reading it grants no cryptographic capability.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fingerprint::{
    check_fingerprint, AttributeDigests, DeviceProfile, FingerprintCheck, FINGERPRINT_LEN,
};
use memvault_common::{Error, Result, VaultId};
use memvault_crypto::keys::random_array;

/// Current session schema.
pub const SESSION_SCHEMA_VERSION: u32 = 2;

/// Token length in bytes.
pub const TOKEN_LEN: usize = 32;

/// Minimum accepted token entropy estimate.
pub const MIN_ENTROPY_BITS_PER_BYTE: f64 = 7.0;

const MINT_ATTEMPTS: usize = 8;

/// Estimate token entropy in bits per byte.
///
/// 32 bytes are too few samples for a byte-level histogram (the plug-in
/// estimate cannot exceed 5 bits), so the estimate is taken over the 64
/// nibbles with a Miller-Madow bias correction and scaled to bytes.
pub fn estimate_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 16];
    for byte in bytes {
        counts[(byte >> 4) as usize] += 1;
        counts[(byte & 0x0f) as usize] += 1;
    }

    let samples = (bytes.len() * 2) as f64;
    let mut observed = 0usize;
    let mut entropy = 0.0;
    for &count in counts.iter().filter(|c| **c > 0) {
        observed += 1;
        let p = count as f64 / samples;
        entropy -= p * p.log2();
    }

    let correction = (observed as f64 - 1.0) / (2.0 * samples * std::f64::consts::LN_2);
    ((entropy + correction) * 2.0).clamp(0.0, 8.0)
}

/// Session record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(with = "memvault_crypto::encoding::b64_array")]
    pub token: [u8; TOKEN_LEN],
    pub vault_id: VaultId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "memvault_crypto::encoding::b64_array")]
    pub device_fingerprint: [u8; FINGERPRINT_LEN],
    /// Absent on records written before per-attribute digests existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_attributes: Option<AttributeDigests>,
    pub schema_version: u32,
    pub is_demo: bool,
    pub entropy_estimate: f64,
}

/// Version 1 layout: no demo flag, no stored entropy estimate.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecordV1 {
    #[serde(with = "memvault_crypto::encoding::b64_array")]
    token: [u8; TOKEN_LEN],
    vault_id: VaultId,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(with = "memvault_crypto::encoding::b64_array")]
    device_fingerprint: [u8; FINGERPRINT_LEN],
}

/// Inputs for validating a record against the current environment.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub vault_id: VaultId,
    pub max_age: ChronoDuration,
    pub clock_skew: ChronoDuration,
    pub allow_demo: bool,
}

/// A record that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidSession {
    /// Earliest of the explicit expiry and the age ceiling.
    pub effective_expiry: DateTime<Utc>,
    pub fingerprint: FingerprintCheck,
}

impl SessionRecord {
    /// Mint a new session for the current device.
    ///
    /// Tokens whose estimate falls below the threshold are redrawn, so a
    /// freshly minted record always validates on the same device.
    ///
    /// # Errors
    /// - `SessionInvalid` if `now + expiry` is not a representable time
    pub fn mint(
        vault_id: VaultId,
        device: &DeviceProfile,
        expiry: Option<ChronoDuration>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expires_at = match expiry {
            Some(e) => Some(
                now.checked_add_signed(e)
                    .ok_or_else(|| Error::SessionInvalid("session expiry out of range".to_string()))?,
            ),
            None => None,
        };

        for _ in 0..MINT_ATTEMPTS {
            let token: [u8; TOKEN_LEN] = random_array();
            let entropy_estimate = estimate_entropy(&token);
            if entropy_estimate < MIN_ENTROPY_BITS_PER_BYTE {
                continue;
            }

            return Ok(Self {
                token,
                vault_id,
                created_at: now,
                expires_at,
                device_fingerprint: device.fingerprint(),
                device_attributes: Some(device.attribute_digests()),
                schema_version: SESSION_SCHEMA_VERSION,
                is_demo: false,
                entropy_estimate,
            });
        }

        Err(Error::Crypto("Could not draw a session token".to_string()))
    }

    /// Parse a stored record, upgrading older schemas.
    pub fn from_stored(value: serde_json::Value) -> Result<(Self, bool)> {
        let version = value
            .get("schemaVersion")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);

        match version {
            1 => {
                let v1: SessionRecordV1 = serde_json::from_value(value)
                    .map_err(|e| Error::SessionInvalid(format!("unreadable v1 record: {}", e)))?;
                let record = Self {
                    entropy_estimate: estimate_entropy(&v1.token),
                    token: v1.token,
                    vault_id: v1.vault_id,
                    created_at: v1.created_at,
                    expires_at: v1.expires_at,
                    device_fingerprint: v1.device_fingerprint,
                    device_attributes: None,
                    schema_version: SESSION_SCHEMA_VERSION,
                    is_demo: false,
                };
                Ok((record, true))
            }
            v if v == u64::from(SESSION_SCHEMA_VERSION) => {
                let record = serde_json::from_value(value)
                    .map_err(|e| Error::SessionInvalid(format!("unreadable record: {}", e)))?;
                Ok((record, false))
            }
            v => Err(Error::SessionInvalid(format!("unsupported schema version {}", v))),
        }
    }

    /// Validate this record.
    ///
    /// # Errors
    /// - `SessionInvalid` naming the first failed check
    pub fn validate(
        &self,
        policy: &SessionPolicy,
        device: &DeviceProfile,
        now: DateTime<Utc>,
    ) -> Result<ValidSession> {
        let invalid = |reason: &str| Err(Error::SessionInvalid(reason.to_string()));

        if self.schema_version != SESSION_SCHEMA_VERSION {
            return invalid("schema version mismatch");
        }
        if self.vault_id != policy.vault_id {
            return invalid("session belongs to another vault");
        }
        if self.is_demo && !policy.allow_demo {
            return invalid("demo session");
        }

        let measured = estimate_entropy(&self.token);
        if measured < MIN_ENTROPY_BITS_PER_BYTE || self.entropy_estimate < MIN_ENTROPY_BITS_PER_BYTE {
            return invalid("token entropy below threshold");
        }

        match now.checked_add_signed(policy.clock_skew) {
            Some(latest) if self.created_at <= latest => {}
            _ => return invalid("session created in the future"),
        }

        let Some(ceiling) = self.created_at.checked_add_signed(policy.max_age) else {
            return invalid("session age ceiling out of range");
        };
        if now >= ceiling {
            return invalid("session older than maximum age");
        }
        let effective_expiry = match self.expires_at {
            Some(expires_at) if now >= expires_at => return invalid("session expired"),
            Some(expires_at) => expires_at.min(ceiling),
            None => ceiling,
        };

        let fingerprint = check_fingerprint(
            &self.device_fingerprint,
            self.device_attributes.as_ref(),
            device,
        );
        match fingerprint {
            FingerprintCheck::Match => {}
            FingerprintCheck::Degraded => {
                warn!(
                    present = device.present_count(),
                    "Device fingerprint differs only in unreported attributes; accepting"
                );
            }
            FingerprintCheck::Mismatch => return invalid("device fingerprint mismatch"),
        }

        Ok(ValidSession {
            effective_expiry,
            fingerprint,
        })
    }
}
