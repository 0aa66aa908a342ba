//! Cryptographic primitives for the memory vault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256
//! - Authenticated encryption using AES-256-GCM
//! - Secure key management with automatic zeroization
//! - The encrypted container format used for export and import
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod container;
pub mod encoding;
pub mod kdf;
pub mod keys;

pub use aead::{open, seal, SealedBox};
pub use container::{ContainerCodec, ContainerHeader, PayloadSchema, MAGIC};
pub use kdf::{derive_key, derive_key_offloaded, offload, Derivation, DerivationMethod, KdfParams};
pub use keys::{MasterKey, Salt};
