//! Runtime configuration for the vault security core.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use memvault_common::{Error, Result, VaultId};
use memvault_crypto::kdf::{KdfParams, DEFAULT_ITERATIONS};

/// Lowest iteration count accepted from a configuration file.
pub const MIN_ITERATIONS: u32 = 10_000;

/// Default absolute session lifetime: 30 days.
pub const DEFAULT_MAX_SESSION_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// Default status cache lifetime.
pub const DEFAULT_STATUS_CACHE_TTL_MS: u64 = 1_000;

/// Upper bound on the status cache lifetime.
pub const MAX_STATUS_CACHE_TTL_MS: u64 = 60_000;

/// Tolerated clock skew for session timestamps.
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 300;

/// Upper bound on any configured session duration: 100 years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Vault configuration.
///
/// Every field has a default, so an empty JSON object is a valid
/// configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Identifier recorded in sessions and exports.
    pub vault_id: VaultId,
    /// PBKDF2 rounds for new settings. Containers always use the standard count.
    pub kdf_iterations: u32,
    /// Absolute ceiling on session age, applied whatever `session_expiry_secs` says.
    pub max_session_age_secs: u64,
    /// Explicit session expiry. `None` means sessions end only on lock or at the ceiling.
    pub session_expiry_secs: Option<u64>,
    /// How long a computed status is reused.
    pub status_cache_ttl_ms: u64,
    /// Whether demo sessions may grant re-entry.
    pub allow_demo_sessions: bool,
    /// Tolerated forward skew on `createdAt`.
    pub clock_skew_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            vault_id: VaultId::new("default").unwrap_or_else(|_| VaultId::generate()),
            kdf_iterations: DEFAULT_ITERATIONS,
            max_session_age_secs: DEFAULT_MAX_SESSION_AGE_SECS,
            session_expiry_secs: None,
            status_cache_ttl_ms: DEFAULT_STATUS_CACHE_TTL_MS,
            allow_demo_sessions: false,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }
}

impl VaultConfig {
    /// Configuration with cheap key derivation for tests.
    ///
    /// Not validated; never use outside tests.
    pub fn for_testing() -> Self {
        Self {
            kdf_iterations: 1_000,
            ..Self::default()
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "kdfIterations must be at least {}",
                MIN_ITERATIONS
            )));
        }
        if self.max_session_age_secs == 0 {
            return Err(Error::InvalidInput(
                "maxSessionAgeSecs must be positive".to_string(),
            ));
        }
        if self.session_expiry_secs == Some(0) {
            return Err(Error::InvalidInput(
                "sessionExpirySecs must be positive when set".to_string(),
            ));
        }
        for (field, secs) in [
            ("maxSessionAgeSecs", Some(self.max_session_age_secs)),
            ("sessionExpirySecs", self.session_expiry_secs),
            ("clockSkewSecs", Some(self.clock_skew_secs)),
        ] {
            if secs.is_some_and(|s| s > MAX_DURATION_SECS) {
                return Err(Error::InvalidInput(format!(
                    "{} cannot exceed {}",
                    field, MAX_DURATION_SECS
                )));
            }
        }
        if self.status_cache_ttl_ms > MAX_STATUS_CACHE_TTL_MS {
            return Err(Error::InvalidInput(format!(
                "statusCacheTtlMs cannot exceed {}",
                MAX_STATUS_CACHE_TTL_MS
            )));
        }
        Ok(())
    }

    /// KDF parameters derived from this configuration.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::with_iterations(self.kdf_iterations)
    }

    pub fn max_session_age(&self) -> ChronoDuration {
        ChronoDuration::seconds(clamp_secs(self.max_session_age_secs))
    }

    pub fn session_expiry(&self) -> Option<ChronoDuration> {
        self.session_expiry_secs
            .map(|secs| ChronoDuration::seconds(clamp_secs(secs)))
    }

    pub fn clock_skew(&self) -> ChronoDuration {
        ChronoDuration::seconds(clamp_secs(self.clock_skew_secs))
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }

    /// Parse and validate JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load from a file, falling back to defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

// Unvalidated configurations are capped the same way `validate` bounds them.
fn clamp_secs(secs: u64) -> i64 {
    secs.min(MAX_DURATION_SECS) as i64
}
