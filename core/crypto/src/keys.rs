//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use memvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Salt length for the vault settings record.
pub const SETTINGS_SALT_LEN: usize = 16;

/// Salt length embedded in every encrypted container.
pub const CONTAINER_SALT_LEN: usize = 32;

/// Master key derived from the user passphrase.
///
/// Never serialized. Cloning is deliberately not offered so the live key
/// has exactly one owner.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Constant-time equality against another key.
    pub fn ct_eq(&self, other: &MasterKey) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Salt(#[serde(with = "crate::encoding::b64")] Vec<u8>);

impl Salt {
    /// Generate a random salt of `len` bytes.
    pub fn generate(len: usize) -> Self {
        let mut salt = vec![0u8; len];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from a byte slice.
    ///
    /// # Errors
    /// - Returns error if the slice is empty
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("Salt cannot be empty".to_string()));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Salt length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fill a fixed-size array from the OS RNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
