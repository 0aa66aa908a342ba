//! Vault security core for the memory vault.
//!
//! This module provides:
//! - Passphrase verification and the in-memory master key ([`Keyring`])
//! - Lock-state authority with session persistence ([`SessionStateManager`])
//! - Lock-gated capsule storage ([`CapsuleStore`])
//! - Encrypted export and import ([`VaultOperations`])
//! - A channel front end for hosts ([`VaultController`], [`VaultClient`])
//!
//! # Architecture
//! Every persisted record goes through a shared [`memvault_storage::KeyValueStore`].
//! Managers in different execution contexts sharing one store observe each
//! other through its change notifications.

pub mod capsules;
pub mod config;
pub mod controller;
pub mod fingerprint;
pub mod keyring;
pub mod manager;
pub mod operations;
pub mod records;
pub mod session;
pub mod settings;
pub mod state;
pub mod status;

pub use capsules::{Capsule, CapsuleContent, CapsuleStore, UnlockGate};
pub use config::VaultConfig;
pub use controller::{VaultClient, VaultController, VaultRequest};
pub use fingerprint::{AttributeDigests, DeviceProfile, EnvironmentProbe, HostProbe, StaticProbe};
pub use keyring::Keyring;
pub use manager::{SessionStateManager, VaultEvent};
pub use operations::{ImportSummary, VaultExport, VaultOperations};
pub use session::SessionRecord;
pub use settings::VaultSettings;
pub use status::{KeyringState, VaultStatus};
