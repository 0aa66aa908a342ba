//! Usage statistics. Observability only; lock status never reads these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultState {
    pub last_unlocked_at: Option<DateTime<Utc>>,
    pub last_locked_at: Option<DateTime<Utc>>,
    pub unlock_count: u64,
}

impl VaultState {
    pub fn record_unlock(&mut self, at: DateTime<Utc>) {
        self.last_unlocked_at = Some(at);
        self.unlock_count = self.unlock_count.saturating_add(1);
    }

    pub fn record_lock(&mut self, at: DateTime<Utc>) {
        self.last_locked_at = Some(at);
    }
}
