//! Key derivation service: settings bootstrap, verifier handling, and the
//! single in-memory copy of the master key.

use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::records::{RecordStore, SETTINGS_KEY};
use crate::settings::{KdfProfile, VaultSettings};
use crate::status::KeyringState;
use memvault_common::{Error, Result, SensitiveBytes};
use memvault_crypto::kdf::{derive_key_offloaded, Derivation, KdfParams};
use memvault_crypto::MasterKey;

/// Owns the live master key.
///
/// The key exists only in memory, is never serialized, and is zeroized
/// when replaced, locked, or dropped with the keyring. Session re-entry
/// sets a bypass deadline instead of a key; the vault then reads as
/// unlocked without any cryptographic capability.
pub struct Keyring {
    records: RecordStore,
    params: KdfParams,
    settings: Mutex<Option<VaultSettings>>,
    live: RwLock<Option<MasterKey>>,
    bypass_until: RwLock<Option<DateTime<Utc>>>,
    unlocked_at: RwLock<Option<DateTime<Utc>>>,
}

impl Keyring {
    /// `params` apply only to settings created by this keyring; existing
    /// settings keep the iteration count they were created with.
    pub fn new(records: RecordStore, params: KdfParams) -> Self {
        Self {
            records,
            params,
            settings: Mutex::new(None),
            live: RwLock::new(None),
            bypass_until: RwLock::new(None),
            unlocked_at: RwLock::new(None),
        }
    }

    /// Load the stored settings, upgrading a legacy record in place.
    ///
    /// Settings are cached once they carry a verifier, since neither the
    /// salt nor the verifier change after that.
    pub async fn settings(&self) -> Result<Option<VaultSettings>> {
        let mut cached = self.settings.lock().await;
        if let Some(settings) = cached.as_ref() {
            return Ok(Some(settings.clone()));
        }

        let loaded = self.load_settings().await?;
        if let Some(settings) = &loaded {
            if settings.has_verifier() {
                *cached = Some(settings.clone());
            }
        }
        Ok(loaded)
    }

    async fn load_settings(&self) -> Result<Option<VaultSettings>> {
        let raw = match self.records.load_raw(SETTINGS_KEY).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let (settings, upgraded) = VaultSettings::from_stored(raw)?;
        if upgraded {
            info!(schema = settings.schema_version, "Upgrading stored vault settings");
            self.records.save(SETTINGS_KEY, &settings).await?;
        }
        Ok(Some(settings))
    }

    /// Return existing settings or create and persist fresh ones.
    ///
    /// # Postconditions
    /// - A settings record with a random salt exists in the store
    /// - An existing record is never replaced
    pub async fn ensure_settings(&self) -> Result<VaultSettings> {
        if let Some(settings) = self.settings().await? {
            return Ok(settings);
        }

        let _guard = self.settings.lock().await;
        // Another context may have written them between the two checks.
        if let Some(settings) = self.load_settings().await? {
            return Ok(settings);
        }

        let settings = VaultSettings::create(&self.params);
        self.records.save(SETTINGS_KEY, &settings).await?;
        info!(iterations = settings.iterations, "Vault settings created");
        Ok(settings)
    }

    /// Derive a key from `passphrase` and store a verifier for it.
    ///
    /// Does nothing and returns `false` when a verifier already exists, so a
    /// second setup attempt cannot replace the first passphrase.
    pub async fn install_verifier(&self, passphrase: &SensitiveBytes) -> Result<bool> {
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }

        let mut cached = self.settings.lock().await;
        let mut settings = self
            .load_settings()
            .await?
            .ok_or(Error::VaultNotInitialized)?;
        if settings.has_verifier() {
            debug!("Verifier already present");
            *cached = Some(settings);
            return Ok(false);
        }

        let derivation = self.derive(passphrase, &settings).await?;
        settings.verifier = Some(VaultSettings::seal_verifier(&derivation.key)?);
        settings.kdf_profile = Some(KdfProfile::new(
            derivation.method,
            derivation.elapsed.as_millis() as u64,
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        ));

        self.records.save(SETTINGS_KEY, &settings).await?;
        info!(
            method = derivation.method.as_str(),
            elapsed_ms = derivation.elapsed.as_millis() as u64,
            "Passphrase verifier installed"
        );
        *cached = Some(settings);
        Ok(true)
    }

    /// Derive a key, check it against the verifier, and keep it.
    ///
    /// # Errors
    /// - `VaultNotInitialized` if settings or the verifier are missing
    /// - `InvalidPassphrase` for an empty or wrong passphrase
    pub async fn unlock_with_passphrase(&self, passphrase: &SensitiveBytes) -> Result<()> {
        let key = self.checked_key(passphrase).await?;

        *write(&self.live) = Some(key);
        *write(&self.unlocked_at) = Some(Utc::now());
        debug!("Master key held");
        Ok(())
    }

    /// Check `passphrase` without changing lock state.
    pub async fn verify_passphrase(&self, passphrase: &SensitiveBytes) -> Result<()> {
        self.checked_key(passphrase).await.map(drop)
    }

    async fn checked_key(&self, passphrase: &SensitiveBytes) -> Result<MasterKey> {
        if passphrase.is_empty() {
            return Err(Error::InvalidPassphrase);
        }

        let settings = self.settings().await?.ok_or(Error::VaultNotInitialized)?;
        if !settings.has_verifier() {
            return Err(Error::VaultNotInitialized);
        }

        let Derivation { key, .. } = self.derive(passphrase, &settings).await?;
        if let Err(e) = settings.check_verifier(&key) {
            warn!("Passphrase rejected");
            return Err(e);
        }
        Ok(key)
    }

    async fn derive(&self, passphrase: &SensitiveBytes, settings: &VaultSettings) -> Result<Derivation> {
        derive_key_offloaded(passphrase.clone(), settings.salt.clone(), settings.kdf_params())
            .await
            .map_err(|e| match e {
                Error::InvalidInput(_) => Error::InvalidPassphrase,
                other => other,
            })
    }

    /// Drop the key and any session bypass. Returns whether anything was held.
    pub fn lock(&self) -> bool {
        let had_key = write(&self.live).take().is_some();
        let had_bypass = write(&self.bypass_until).take().is_some();
        *write(&self.unlocked_at) = None;
        had_key || had_bypass
    }

    /// Report unlocked until `until` without holding a key.
    pub fn set_session_bypass(&self, until: DateTime<Utc>) {
        *write(&self.bypass_until) = Some(until);
        let mut unlocked_at = write(&self.unlocked_at);
        if unlocked_at.is_none() {
            *unlocked_at = Some(Utc::now());
        }
    }

    pub fn clear_session_bypass(&self) {
        *write(&self.bypass_until) = None;
        if !self.has_live_key() {
            *write(&self.unlocked_at) = None;
        }
    }

    pub fn bypass_until(&self) -> Option<DateTime<Utc>> {
        *read(&self.bypass_until)
    }

    pub fn unlocked_at(&self) -> Option<DateTime<Utc>> {
        *read(&self.unlocked_at)
    }

    pub fn has_live_key(&self) -> bool {
        read(&self.live).is_some()
    }

    /// In-memory check only; never touches storage.
    pub fn is_unlocked(&self) -> bool {
        self.has_live_key() || self.bypass_until().map_or(false, |until| Utc::now() < until)
    }

    pub fn state(&self) -> KeyringState {
        if self.has_live_key() {
            KeyringState::KeyHeld
        } else if self.is_unlocked() {
            KeyringState::SessionOnly
        } else {
            KeyringState::Locked
        }
    }

    /// # Errors
    /// - `VaultLocked` unless a derived key is held
    pub fn require_key(&self) -> Result<()> {
        if self.has_live_key() {
            Ok(())
        } else {
            Err(Error::VaultLocked)
        }
    }

    /// Run `f` with the live key.
    pub fn with_key<R>(&self, f: impl FnOnce(&MasterKey) -> R) -> Result<R> {
        let guard = read(&self.live);
        guard.as_ref().map(f).ok_or(Error::VaultLocked)
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
