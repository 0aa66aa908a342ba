//! Session state manager: the single authority on whether the vault is
//! locked.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capsules::UnlockGate;
use crate::config::VaultConfig;
use crate::fingerprint::{EnvironmentProbe, HostProbe};
use crate::keyring::Keyring;
use crate::records::{InitializedMarker, RecordStore, INITIALIZED_KEY, SESSION_KEY, STATE_KEY};
use crate::session::{SessionPolicy, SessionRecord, ValidSession};
use crate::state::VaultState;
use crate::status::{KeyringState, StatusCache, VaultStatus};
use memvault_common::{Error, Result, SensitiveBytes};
use memvault_storage::{ChangeKind, KeyValueStore, StoreChange};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lock-state transitions, for UI refresh and dependent services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Initialized,
    Unlocked,
    Locked,
    /// Another context changed a vault record.
    ExternalChange { key: String },
}

/// Tracks lock state for one execution context.
///
/// Several managers may share a store; each one owns its keyring and
/// observes the others through store notifications, so a lock in one
/// context removes the session and locks every other context.
pub struct SessionStateManager {
    config: VaultConfig,
    records: RecordStore,
    keyring: Keyring,
    probe: Arc<dyn EnvironmentProbe>,
    cache: StatusCache,
    events: broadcast::Sender<VaultEvent>,
    started: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStateManager {
    pub fn new(config: VaultConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_probe(config, store, Arc::new(HostProbe))
    }

    /// Create with a custom environment probe.
    pub fn with_probe(
        config: VaultConfig,
        store: Arc<dyn KeyValueStore>,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        let records = RecordStore::new(store);
        let keyring = Keyring::new(records.clone(), config.kdf_params());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            cache: StatusCache::new(config.status_cache_ttl()),
            config,
            records,
            keyring,
            probe,
            events,
            started: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    /// Restore a persisted session and start watching the store.
    ///
    /// Safe to call more than once; only the first call does anything.
    /// Storage failures leave the vault locked rather than failing.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.spawn_watcher();

        match self.try_reenter(true).await {
            Ok(true) => info!(vault = %self.config.vault_id, "Session restored"),
            Ok(false) => debug!("No session to restore"),
            Err(e) => warn!(error = %e, "Session restore failed; staying locked"),
        }
        self.cache.invalidate();
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut changes = self.records.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Store notifications lagged");
                        match manager.upgrade() {
                            Some(manager) => {
                                manager.cache.invalidate();
                                continue;
                            }
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };

                match manager.upgrade() {
                    Some(manager) => manager.on_store_change(change).await,
                    None => break,
                }
            }
            debug!("Store watcher stopped");
        });

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn on_store_change(&self, change: StoreChange) {
        if &change.origin == self.records.context_id() {
            return;
        }
        self.cache.invalidate();

        if change.key == SESSION_KEY {
            match change.kind {
                ChangeKind::Removed => {
                    if self.keyring.lock() {
                        info!(origin = %change.origin, "Locked by another context");
                    }
                }
                // Another context's session is never discarded from here.
                ChangeKind::Set if !self.keyring.has_live_key() => {
                    if let Err(e) = self.try_reenter(false).await {
                        warn!(error = %e, "Could not adopt session from another context");
                    }
                }
                ChangeKind::Set => {}
            }
        }

        let _ = self.events.send(VaultEvent::ExternalChange { key: change.key });
    }

    fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            vault_id: self.config.vault_id.clone(),
            max_age: self.config.max_session_age(),
            clock_skew: self.config.clock_skew(),
            allow_demo: self.config.allow_demo_sessions,
        }
    }

    /// Load and validate the stored session.
    ///
    /// Invalid records are treated as absent, and removed when `discard`
    /// is set. Storage errors propagate.
    async fn read_session(&self, discard: bool) -> Result<Option<ValidSession>> {
        let raw = match self.records.load_raw(SESSION_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(Error::Serialization(reason)) => {
                self.invalid_session(&reason, discard).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let record = match SessionRecord::from_stored(raw) {
            Ok((record, upgraded)) => {
                if upgraded && discard {
                    self.records.save(SESSION_KEY, &record).await?;
                }
                record
            }
            Err(e) => {
                self.invalid_session(&e.to_string(), discard).await?;
                return Ok(None);
            }
        };

        match record.validate(&self.policy(), &self.probe.profile(), Utc::now()) {
            Ok(valid) => Ok(Some(valid)),
            Err(e) => {
                self.invalid_session(&e.to_string(), discard).await?;
                Ok(None)
            }
        }
    }

    async fn invalid_session(&self, reason: &str, discard: bool) -> Result<()> {
        if discard {
            info!(reason, "Discarding stored session");
            self.records.remove(SESSION_KEY).await?;
        } else {
            debug!(reason, "Stored session not usable");
        }
        Ok(())
    }

    async fn try_reenter(&self, discard: bool) -> Result<bool> {
        match self.read_session(discard).await? {
            Some(valid) => {
                self.keyring.set_session_bypass(valid.effective_expiry);
                self.cache.invalidate();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current status. Never fails: storage errors produce a degraded
    /// status with `error` set.
    pub async fn get_status(&self) -> VaultStatus {
        if let Some(status) = self.cache.get() {
            return status;
        }

        let generation = self.cache.generation();
        match self.compute_status().await {
            Ok(status) => {
                self.cache.put(generation, status.clone());
                status
            }
            Err(e) => {
                warn!(error = %e, "Status degraded");
                VaultStatus::degraded(
                    self.config.vault_id.clone(),
                    self.keyring.state(),
                    e.user_message(),
                )
            }
        }
    }

    async fn compute_status(&self) -> Result<VaultStatus> {
        let has_settings = self.keyring.settings().await?.is_some();
        let initialized = self
            .records
            .load::<InitializedMarker>(INITIALIZED_KEY)
            .await?
            .is_some();
        let session = self.read_session(false).await?;

        if session.is_none() && self.keyring.state() == KeyringState::SessionOnly {
            self.keyring.clear_session_bypass();
        }

        let last_unlocked_at = self
            .records
            .load::<VaultState>(STATE_KEY)
            .await?
            .and_then(|state| state.last_unlocked_at)
            .or_else(|| self.keyring.unlocked_at());

        Ok(VaultStatus {
            initialized,
            has_settings,
            is_unlocked: self.keyring.is_unlocked(),
            has_valid_session: session.is_some(),
            session_expires_at: session.map(|s| s.effective_expiry),
            last_unlocked_at,
            vault_id: self.config.vault_id.clone(),
            keyring_state: self.keyring.state(),
            error: None,
        })
    }

    /// In-memory lock check. Never touches storage.
    pub fn is_unlocked(&self) -> bool {
        self.keyring.is_unlocked()
    }

    /// # Errors
    /// - `VaultLocked` unless a passphrase-derived key is held
    pub fn require_key(&self) -> Result<()> {
        self.keyring.require_key()
    }

    pub async fn verify_passphrase(&self, passphrase: &SensitiveBytes) -> Result<()> {
        self.keyring.verify_passphrase(passphrase).await
    }

    /// Unlock with the passphrase and persist a session.
    ///
    /// # Postconditions
    /// - The key is held and a session record is stored, or neither
    ///
    /// # Errors
    /// - `VaultNotInitialized` if setup never completed
    /// - `InvalidPassphrase` for a wrong passphrase
    /// - Storage errors, after which the vault is locked again
    pub async fn unlock(&self, passphrase: &SensitiveBytes) -> Result<()> {
        self.keyring.unlock_with_passphrase(passphrase).await?;

        if let Err(e) = self.persist_unlock().await {
            warn!(error = %e, "Could not persist session; locking again");
            self.keyring.lock();
            self.cache.invalidate();
            return Err(e);
        }

        self.cache.invalidate();
        let _ = self.events.send(VaultEvent::Unlocked);
        info!(vault = %self.config.vault_id, "Vault unlocked");
        Ok(())
    }

    async fn persist_unlock(&self) -> Result<()> {
        let now = Utc::now();
        let session = SessionRecord::mint(
            self.config.vault_id.clone(),
            &self.probe.profile(),
            self.config.session_expiry(),
            now,
        )?;
        self.records.save(SESSION_KEY, &session).await?;

        let mut state = self.load_state().await;
        state.record_unlock(now);
        self.records.save(STATE_KEY, &state).await
    }

    async fn load_state(&self) -> VaultState {
        match self.records.load::<VaultState>(STATE_KEY).await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "Vault state unreadable; starting fresh");
                VaultState::default()
            }
        }
    }

    /// Lock the vault in this and every other context sharing the store.
    ///
    /// Memory is cleared before storage is touched, so the vault reads as
    /// locked even if removing the session fails.
    pub async fn lock(&self) -> Result<()> {
        let held = self.keyring.lock();
        self.cache.invalidate();

        let removed = self.records.remove(SESSION_KEY).await;
        if held || matches!(removed, Ok(true)) {
            let mut state = self.load_state().await;
            state.record_lock(Utc::now());
            if let Err(e) = self.records.save(STATE_KEY, &state).await {
                debug!(error = %e, "Could not record lock time");
            }

            let _ = self.events.send(VaultEvent::Locked);
            info!(vault = %self.config.vault_id, "Vault locked");
        }
        self.cache.invalidate();

        removed.map(drop)
    }

    /// First-time setup.
    ///
    /// # Preconditions
    /// - No vault has completed setup in this store
    ///
    /// # Postconditions
    /// - Settings, verifier, and initialized marker are stored
    /// - The vault is unlocked with a persisted session
    ///
    /// # Errors
    /// - `AlreadyExists` if setup already completed
    /// - `InvalidPassphrase` if an interrupted setup left a verifier for a
    ///   different passphrase
    pub async fn initialize_vault(&self, passphrase: &SensitiveBytes) -> Result<()> {
        if self
            .records
            .load::<InitializedMarker>(INITIALIZED_KEY)
            .await?
            .is_some()
        {
            return Err(Error::AlreadyExists("Vault already initialized".to_string()));
        }
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }

        self.keyring.ensure_settings().await?;
        if !self.keyring.install_verifier(passphrase).await? {
            info!("Resuming interrupted setup");
        }
        self.keyring.unlock_with_passphrase(passphrase).await?;
        if !self.keyring.has_live_key() {
            return Err(Error::Crypto("Key not held after setup".to_string()));
        }

        let marker = InitializedMarker {
            initialized_at: Utc::now(),
        };
        let persisted = match self.records.save(INITIALIZED_KEY, &marker).await {
            Ok(()) => self.persist_unlock().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.keyring.lock();
            self.cache.invalidate();
            return Err(e);
        }

        self.cache.invalidate();
        let _ = self.events.send(VaultEvent::Initialized);
        let _ = self.events.send(VaultEvent::Unlocked);
        info!(vault = %self.config.vault_id, "Vault initialized");
        Ok(())
    }
}

impl UnlockGate for SessionStateManager {
    fn is_unlocked(&self) -> bool {
        self.keyring.is_unlocked()
    }
}

impl Drop for SessionStateManager {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{DeviceProfile, StaticProbe};
    use memvault_storage::MemoryStore;

    fn probe() -> Arc<dyn EnvironmentProbe> {
        Arc::new(StaticProbe(DeviceProfile {
            os: Some("linux".into()),
            arch: Some("x86_64".into()),
            family: Some("unix".into()),
            cpu_count: Some(2),
            hostname: Some("test-host".into()),
            locale: Some("en_US.UTF-8".into()),
        }))
    }

    fn config() -> VaultConfig {
        VaultConfig {
            status_cache_ttl_ms: 0,
            ..VaultConfig::for_testing()
        }
    }

    fn manager(store: &MemoryStore) -> Arc<SessionStateManager> {
        Arc::new(SessionStateManager::with_probe(
            config(),
            Arc::new(store.new_context()),
            probe(),
        ))
    }

    fn pass(s: &str) -> SensitiveBytes {
        SensitiveBytes::from(s)
    }

    #[tokio::test]
    async fn test_fresh_status() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.initialize().await.unwrap();

        let status = manager.get_status().await;
        assert!(!status.initialized);
        assert!(!status.has_settings);
        assert!(!status.is_unlocked);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_initialize_vault_unlocks() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.initialize().await.unwrap();
        let mut events = manager.subscribe();

        manager.initialize_vault(&pass("open sesame")).await.unwrap();

        let status = manager.get_status().await;
        assert!(status.initialized);
        assert!(status.has_settings);
        assert!(status.is_unlocked);
        assert!(status.has_valid_session);
        assert_eq!(status.keyring_state, KeyringState::KeyHeld);
        assert_eq!(events.recv().await.unwrap(), VaultEvent::Initialized);
        assert_eq!(events.recv().await.unwrap(), VaultEvent::Unlocked);
    }

    #[tokio::test]
    async fn test_initialize_vault_twice_rejected() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.initialize_vault(&pass("open sesame")).await.unwrap();

        assert!(matches!(
            manager.initialize_vault(&pass("other")).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_failure_rolls_back() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.initialize_vault(&pass("open sesame")).await.unwrap();
        manager.lock().await.unwrap();

        store.set_available(false);
        assert!(manager.unlock(&pass("open sesame")).await.is_err());
        assert!(!manager.is_unlocked());
    }

    #[tokio::test]
    async fn test_lock_clears_memory_even_if_store_fails() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.initialize_vault(&pass("open sesame")).await.unwrap();

        store.set_available(false);
        assert!(manager.lock().await.is_err());
        assert!(!manager.is_unlocked());
    }

    #[tokio::test]
    async fn test_require_key_in_session_only_mode() {
        let store = MemoryStore::new();
        let first = manager(&store);
        first.initialize_vault(&pass("open sesame")).await.unwrap();
        drop(first);

        let second = manager(&store);
        second.initialize().await.unwrap();
        assert!(second.is_unlocked());
        assert_eq!(second.keyring().state(), KeyringState::SessionOnly);
        assert!(matches!(second.require_key(), Err(Error::VaultLocked)));

        second.unlock(&pass("open sesame")).await.unwrap();
        assert!(second.require_key().is_ok());
    }

    #[tokio::test]
    async fn test_cached_status_refreshed_by_lock_and_unlock() {
        let store = MemoryStore::new();
        let manager = Arc::new(SessionStateManager::with_probe(
            VaultConfig {
                status_cache_ttl_ms: 60_000,
                ..VaultConfig::for_testing()
            },
            Arc::new(store.new_context()),
            probe(),
        ));
        manager.initialize().await.unwrap();
        manager.initialize_vault(&pass("open sesame")).await.unwrap();
        assert!(manager.get_status().await.is_unlocked);

        let mut events = manager.subscribe();
        manager.lock().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), VaultEvent::Locked);
        let status = manager.get_status().await;
        assert!(!status.is_unlocked);
        assert!(!status.has_valid_session);

        manager.unlock(&pass("open sesame")).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), VaultEvent::Unlocked);
        assert!(manager.get_status().await.is_unlocked);
    }

    #[tokio::test]
    async fn test_interrupted_setup_resumes() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.keyring().ensure_settings().await.unwrap();
        manager.keyring().install_verifier(&pass("first")).await.unwrap();

        assert!(matches!(
            manager.initialize_vault(&pass("second")).await,
            Err(Error::InvalidPassphrase)
        ));
        manager.initialize_vault(&pass("first")).await.unwrap();
        assert!(manager.get_status().await.initialized);
    }
}
