//! Encrypted container format.
//!
//! # Layout
//! ```text
//! [0..4)    magic tag "MVC1"
//! [4..36)   PBKDF2 salt (32 bytes, fresh per container)
//! [36..48)  AES-GCM nonce (12 bytes, fresh per container)
//! [48..n-16) ciphertext of the canonical JSON payload
//! [n-16..n) GCM tag
//! ```
//!
//! The magic and minimum length are checked before any key derivation.
//! Every failure after that point surfaces as [`Error::InvalidPassphrase`],
//! whether the tag, the JSON, or the schema check rejected the bytes.
//!
//! Both directions work on a single buffer: the payload is serialized
//! straight into the output vector behind the header and encrypted in place.

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{decrypt_in_place, encrypt_in_place, generate_nonce, NONCE_SIZE, TAG_SIZE};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{Salt, CONTAINER_SALT_LEN};
use memvault_common::{Error, Result};

/// ASCII magic tag opening every container.
pub const MAGIC: [u8; 4] = *b"MVC1";

const SALT_OFFSET: usize = MAGIC.len();
const NONCE_OFFSET: usize = SALT_OFFSET + CONTAINER_SALT_LEN;

/// Bytes before the ciphertext.
pub const HEADER_LEN: usize = NONCE_OFFSET + NONCE_SIZE;

/// Post-decryption shape check.
///
/// Authentication proves the bytes came from someone holding the
/// passphrase; it says nothing about whether they describe a payload this
/// version understands.
pub trait PayloadSchema {
    fn validate(&self) -> Result<()>;
}

impl PayloadSchema for serde_json::Value {
    fn validate(&self) -> Result<()> {
        if self.is_object() || self.is_array() {
            Ok(())
        } else {
            Err(Error::InvalidInput("Payload must be an object or array".to_string()))
        }
    }
}

/// Parsed fixed-offset header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub salt: [u8; CONTAINER_SALT_LEN],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext_len: usize,
}

/// Encoder/decoder for the container format.
#[derive(Debug, Clone)]
pub struct ContainerCodec {
    params: KdfParams,
}

impl ContainerCodec {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// KDF parameters used for both directions.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Inspect the header without deriving anything.
    ///
    /// # Errors
    /// - `CorruptContainer` if the magic is wrong or the input is too short
    pub fn peek_header(bytes: &[u8]) -> Result<ContainerHeader> {
        if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::CorruptContainer("Unrecognized container format".to_string()));
        }
        if bytes.len() < HEADER_LEN + TAG_SIZE {
            return Err(Error::CorruptContainer("Container truncated".to_string()));
        }

        let mut salt = [0u8; CONTAINER_SALT_LEN];
        salt.copy_from_slice(&bytes[SALT_OFFSET..NONCE_OFFSET]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[NONCE_OFFSET..HEADER_LEN]);

        Ok(ContainerHeader {
            salt,
            nonce,
            ciphertext_len: bytes.len() - HEADER_LEN - TAG_SIZE,
        })
    }

    /// Serialize and encrypt `payload` under `passphrase`.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T, passphrase: &[u8]) -> Result<Vec<u8>> {
        let salt = Salt::generate(CONTAINER_SALT_LEN);
        let key = derive_key(passphrase, &salt, &self.params)?;
        let nonce = generate_nonce();

        let mut out = Vec::with_capacity(HEADER_LEN + 1024 + TAG_SIZE);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(salt.as_bytes());
        out.extend_from_slice(&nonce);

        if let Err(e) = serde_json::to_writer(&mut out, payload) {
            out.zeroize();
            return Err(Error::Serialization(e.to_string()));
        }

        let tag = match encrypt_in_place(&key, &nonce, &mut out[HEADER_LEN..]) {
            Ok(tag) => tag,
            Err(e) => {
                out.zeroize();
                return Err(e);
            }
        };
        out.extend_from_slice(&tag);

        debug!(bytes = out.len(), "Container encoded");
        Ok(out)
    }

    /// Decrypt, authenticate, parse and validate a container.
    pub fn decode<T>(&self, bytes: &[u8], passphrase: &[u8]) -> Result<T>
    where
        T: DeserializeOwned + PayloadSchema,
    {
        let plaintext = self.open_bytes(bytes, passphrase)?;

        let payload: T =
            serde_json::from_slice(&plaintext).map_err(|_| Error::InvalidPassphrase)?;
        payload.validate().map_err(|_| Error::InvalidPassphrase)?;

        Ok(payload)
    }

    /// Decrypt and authenticate, returning the raw plaintext.
    pub fn open_bytes(&self, bytes: &[u8], passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let header = Self::peek_header(bytes)?;

        let salt = Salt::from_slice(&header.salt)?;
        let key = derive_key(passphrase, &salt, &self.params).map_err(|_| Error::InvalidPassphrase)?;

        let tag_offset = bytes.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[tag_offset..]);

        let mut buffer = Zeroizing::new(bytes[HEADER_LEN..tag_offset].to_vec());
        decrypt_in_place(&key, &header.nonce, &mut buffer, &tag)
            .map_err(|_| Error::InvalidPassphrase)?;

        Ok(buffer)
    }
}

impl Default for ContainerCodec {
    fn default() -> Self {
        Self::new(KdfParams::standard())
    }
}
