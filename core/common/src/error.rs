//! Common error types for the memory vault.

use thiserror::Error;

/// Text shown to users for every authentication failure.
///
/// Verifier, tag and sentinel mismatches all map to this one message so the
/// caller cannot tell which check rejected the passphrase.
pub const GENERIC_AUTH_MESSAGE: &str = "Unable to unlock. Please check your passphrase and try again.";

/// Top-level error type for vault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Passphrase did not verify. Never carries detail about which check failed.
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    /// No vault settings exist yet.
    #[error("Vault is not initialized")]
    VaultNotInitialized,

    /// Operation needs the vault unlocked (or needs the live key).
    #[error("Vault is locked")]
    VaultLocked,

    /// Container bytes are structurally wrong, rejected before any key derivation.
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    /// Persisted session failed validation. Callers treat this as "no session".
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// Persistent store read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Message suitable for showing to an end user.
    ///
    /// Authentication failures collapse to [`GENERIC_AUTH_MESSAGE`]. Only the
    /// not-initialized and locked states get specific guidance.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidPassphrase | Error::CorruptContainer(_) | Error::Crypto(_) => {
                GENERIC_AUTH_MESSAGE.to_string()
            }
            Error::VaultNotInitialized => {
                "No vault has been set up yet. Create one with a new passphrase.".to_string()
            }
            Error::VaultLocked => "The vault is locked. Unlock it with your passphrase.".to_string(),
            Error::SessionInvalid(_) => "Your session ended. Unlock the vault again.".to_string(),
            Error::Storage(_) | Error::Io(_) => {
                "Vault storage is unavailable right now. Try again shortly.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether this error is an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::InvalidPassphrase)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
