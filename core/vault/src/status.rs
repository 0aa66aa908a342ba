//! Status snapshots and the short-lived status cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use memvault_common::VaultId;

/// What the keyring currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyringState {
    Locked,
    /// A derived key is held.
    KeyHeld,
    /// Unlocked through a persisted session; no key in memory.
    SessionOnly,
}

/// Point-in-time view of the vault, safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub initialized: bool,
    pub has_settings: bool,
    pub is_unlocked: bool,
    pub has_valid_session: bool,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub last_unlocked_at: Option<DateTime<Utc>>,
    pub vault_id: VaultId,
    pub keyring_state: KeyringState,
    /// Set when the status could not be fully computed.
    pub error: Option<String>,
}

impl VaultStatus {
    /// Conservative status reported when storage cannot be read.
    ///
    /// Always reads as locked. `keyring_state` still reports what the
    /// in-memory keyring holds.
    pub fn degraded(vault_id: VaultId, keyring_state: KeyringState, reason: impl Into<String>) -> Self {
        Self {
            initialized: false,
            has_settings: false,
            is_unlocked: false,
            has_valid_session: false,
            session_expires_at: None,
            last_unlocked_at: None,
            vault_id,
            keyring_state,
            error: Some(reason.into()),
        }
    }

    /// Status reported when the vault service cannot be reached at all.
    pub fn unavailable(vault_id: VaultId, reason: impl Into<String>) -> Self {
        Self::degraded(vault_id, KeyringState::Locked, reason)
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    entry: Option<(Instant, VaultStatus)>,
    generation: u64,
}

/// Caches the last computed status for a short time.
///
/// Every state change bumps the generation. A status computed before an
/// invalidation carries the old generation and is discarded by [`put`],
/// so a stale value can never repopulate the cache after a change.
///
/// [`put`]: StatusCache::put
#[derive(Debug)]
pub struct StatusCache {
    ttl: Duration,
    slot: Mutex<CacheSlot>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(CacheSlot::default()),
        }
    }

    /// Fresh cached status, if any.
    pub fn get(&self) -> Option<VaultStatus> {
        if self.ttl.is_zero() {
            return None;
        }
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.entry
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, status)| status.clone())
    }

    /// Generation to pass back to [`StatusCache::put`].
    pub fn generation(&self) -> u64 {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).generation
    }

    /// Store `status` if nothing changed since `generation` was read.
    pub fn put(&self, generation: u64, status: VaultStatus) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation {
            return false;
        }
        slot.entry = Some((Instant::now(), status));
        true
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation = slot.generation.wrapping_add(1);
        slot.entry = None;
    }
}
