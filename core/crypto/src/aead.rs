//! Authenticated encryption using AES-256-GCM.
//!
//! Nonces are 12 bytes and always drawn from the OS RNG. A key is never used
//! with a caller-chosen nonce outside the in-place helpers, which take the
//! nonce the container codec has just generated.

use aes_gcm::{
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, KEY_LENGTH};
use memvault_common::{Error, Result};

/// Nonce size for AES-GCM (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Ciphertext with its nonce kept alongside, as stored in records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "crate::encoding::b64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext followed by the 16-byte tag.
    #[serde(with = "crate::encoding::b64")]
    pub ciphertext: Vec<u8>,
}

fn cipher(key: &MasterKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        Error::Crypto(format!("Invalid key length: expected {}", KEY_LENGTH))
    })
}

/// Generate a fresh random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&nonce);
    out
}

/// Encrypt plaintext under a fresh nonce.
///
/// # Postconditions
/// - `ciphertext.len() == plaintext.len() + TAG_SIZE`
pub fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<SealedBox> {
    let nonce = generate_nonce();
    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

    Ok(SealedBox { nonce, ciphertext })
}

/// Decrypt and authenticate a sealed box.
///
/// # Errors
/// - Returns error if the box is too short or authentication fails
pub fn open(key: &MasterKey, sealed: &SealedBox) -> Result<Vec<u8>> {
    if sealed.ciphertext.len() < TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    cipher(key)?
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| Error::Crypto("Decryption failed".to_string()))
}

/// Encrypt `buffer` in place and return the detached tag.
pub fn encrypt_in_place(
    key: &MasterKey,
    nonce: &[u8; NONCE_SIZE],
    buffer: &mut [u8],
) -> Result<[u8; TAG_SIZE]> {
    let tag = cipher(key)?
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buffer)
        .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buffer` in place after verifying the detached tag.
///
/// On failure the buffer content is unspecified and must be discarded.
pub fn decrypt_in_place(
    key: &MasterKey,
    nonce: &[u8; NONCE_SIZE],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<()> {
    cipher(key)?
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", buffer, Tag::from_slice(tag))
        .map_err(|_| Error::Crypto("Decryption failed".to_string()))
}
