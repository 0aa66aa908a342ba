//! Key derivation using PBKDF2-HMAC-SHA256.
//!
//! Derivation is CPU-bound and takes hundreds of milliseconds at the default
//! iteration count, so [`derive_key_offloaded`] moves it onto the Tokio
//! blocking pool when a runtime is available.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use memvault_common::{Error, Result, SensitiveBytes};

/// Algorithm identifier stored in vault settings.
pub const KDF_ALGORITHM: &str = "pbkdf2-sha256";

/// Default PBKDF2 round count.
pub const DEFAULT_ITERATIONS: u32 = 250_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of PBKDF2 rounds.
    pub iterations: u32,
}

impl KdfParams {
    /// The production parameter set.
    pub fn standard() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Explicit round count.
    pub fn with_iterations(iterations: u32) -> Self {
        Self { iterations }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::standard()
    }
}

/// Where a derivation actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivationMethod {
    /// On the Tokio blocking pool.
    Worker,
    /// On the calling thread.
    Inline,
}

impl DerivationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationMethod::Worker => "worker",
            DerivationMethod::Inline => "inline",
        }
    }
}

/// Outcome of a timed derivation.
#[derive(Debug)]
pub struct Derivation {
    pub key: MasterKey,
    pub method: DerivationMethod,
    pub elapsed: Duration,
}

/// Derive a master key from a passphrase and salt.
///
/// # Errors
/// - Returns error if the passphrase is empty
/// - Returns error if the iteration count is zero
///
/// # Security
/// - Passphrase is not stored or logged
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    if params.iterations == 0 {
        return Err(Error::Crypto("Invalid KDF parameters: zero iterations".to_string()));
    }
    if salt.is_empty() {
        return Err(Error::Crypto("Invalid KDF parameters: empty salt".to_string()));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(password, salt.as_bytes(), params.iterations, &mut key_bytes);

    Ok(MasterKey::from_bytes(key_bytes))
}

/// Run CPU-bound work off the async executor.
///
/// Uses `spawn_blocking` when called inside a Tokio runtime; otherwise runs
/// `work` synchronously on the current thread. Both paths return the same
/// value.
pub async fn offload<F, R>(work: F) -> Result<(R, DerivationMethod)>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let value = handle
                .spawn_blocking(work)
                .await
                .map_err(|e| Error::Crypto(format!("Worker task failed: {}", e)))??;
            Ok((value, DerivationMethod::Worker))
        }
        Err(_) => Ok((work()?, DerivationMethod::Inline)),
    }
}

/// Derive a key off the interactive path.
pub async fn derive_key_offloaded(
    password: SensitiveBytes,
    salt: Salt,
    params: KdfParams,
) -> Result<Derivation> {
    let started = Instant::now();
    let (key, method) = offload(move || derive_key(password.as_bytes(), &salt, &params)).await?;
    let elapsed = started.elapsed();

    debug!(
        method = method.as_str(),
        iterations = params.iterations,
        elapsed_ms = elapsed.as_millis() as u64,
        "Key derived"
    );

    Ok(Derivation {
        key,
        method,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams::with_iterations(1_000)
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_slice(&[42u8; 16]).unwrap();

        let key1 = derive_key(b"test-password-123", &salt, &fast()).unwrap();
        let key2 = derive_key(b"test-password-123", &salt, &fast()).unwrap();

        assert!(key1.ct_eq(&key2));
    }

    #[test]
    fn test_derive_key_different_salt() {
        let salt1 = Salt::from_slice(&[1u8; 16]).unwrap();
        let salt2 = Salt::from_slice(&[2u8; 16]).unwrap();

        let key1 = derive_key(b"test-password-123", &salt1, &fast()).unwrap();
        let key2 = derive_key(b"test-password-123", &salt2, &fast()).unwrap();

        assert!(!key1.ct_eq(&key2));
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        let salt = Salt::generate(16);
        assert!(derive_key(b"", &salt, &fast()).is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let salt = Salt::generate(16);
        assert!(derive_key(b"pw", &salt, &KdfParams::with_iterations(0)).is_err());
    }

    #[test]
    fn test_known_vector() {
        // PBKDF2-HMAC-SHA256("password", "salt", 1, 32)
        let salt = Salt::from_slice(b"salt").unwrap();
        let key = derive_key(b"password", &salt, &KdfParams::with_iterations(1)).unwrap();
        assert_eq!(
            key.as_bytes()[..8],
            [0x12, 0x0f, 0xb6, 0xcf, 0xfc, 0xf8, 0xb3, 0x2c]
        );
    }

    #[tokio::test]
    async fn test_offloaded_uses_worker() {
        let salt = Salt::generate(16);
        let derived = derive_key_offloaded(SensitiveBytes::from("pw"), salt.clone(), fast())
            .await
            .unwrap();
        let direct = derive_key(b"pw", &salt, &fast()).unwrap();

        assert_eq!(derived.method, DerivationMethod::Worker);
        assert!(derived.key.ct_eq(&direct));
    }

    #[test]
    fn test_offloaded_falls_back_inline_without_runtime() {
        let salt = Salt::generate(16);
        let derived = futures::executor::block_on(derive_key_offloaded(
            SensitiveBytes::from("pw"),
            salt.clone(),
            fast(),
        ))
        .unwrap();
        let direct = derive_key(b"pw", &salt, &fast()).unwrap();

        assert_eq!(derived.method, DerivationMethod::Inline);
        assert!(derived.key.ct_eq(&direct));
    }
}
