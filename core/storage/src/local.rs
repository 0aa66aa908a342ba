//! Local filesystem key/value store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{
    publish, validate_key, ChangeKind, ContextId, KeyValueStore, StoreChange,
    CHANGE_CHANNEL_CAPACITY,
};
use memvault_common::{Error, Result};

const VALUE_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Local filesystem store.
///
/// Each key is a file `<root>/<key>.json`. Writes go to a temporary file
/// that is fsynced and then renamed over the target, so a reader never sees
/// a torn value even if the process dies mid-write.
///
/// Notifications reach every handle cloned from the same store via
/// [`LocalStore::new_context`]. Other processes opening the same directory
/// see the data but not the notifications.
pub struct LocalStore {
    root: PathBuf,
    changes: Arc<broadcast::Sender<StoreChange>>,
    context: ContextId,
}

impl LocalStore {
    /// Create a new local store rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            changes: Arc::new(changes),
            context: ContextId::new(),
        })
    }

    /// Another handle on the same directory and notification channel.
    pub fn new_context(&self) -> Self {
        Self {
            root: self.root.clone(),
            changes: self.changes.clone(),
            context: ContextId::new(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, VALUE_EXTENSION))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!(".{}.{}.{}", key, self.context, TEMP_EXTENSION))
    }

    fn storage_err(action: &str, key: &str, e: std::io::Error) -> Error {
        Error::Storage(format!("Failed to {} '{}': {}", action, key, e))
    }

    fn notify(&self, key: &str, kind: ChangeKind) {
        publish(
            &self.changes,
            StoreChange {
                key: key.to_string(),
                kind,
                origin: self.context.clone(),
            },
        );
    }

    /// Make the rename durable on POSIX. The file content is already synced.
    #[cfg(unix)]
    async fn sync_root(&self) {
        if let Ok(dir) = fs::File::open(&self.root).await {
            let _ = dir.sync_all().await;
        }
    }

    #[cfg(not(unix))]
    async fn sync_root(&self) {}
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    fn context_id(&self) -> &ContextId {
        &self.context
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;

        match fs::read(self.value_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::storage_err("read", key, e)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;

        let temp = self.temp_path(key);
        let target = self.value_path(key);

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| Self::storage_err("create", key, e))?;
        let written = match file.write_all(&value).await {
            Ok(()) => match file.flush().await {
                Ok(()) => file.sync_all().await.map_err(|e| ("sync", e)),
                Err(e) => Err(("write", e)),
            },
            Err(e) => Err(("write", e)),
        };
        drop(file);
        if let Err((action, e)) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(Self::storage_err(action, key, e));
        }

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Self::storage_err("commit", key, e));
        }
        self.sync_root().await;

        debug!(key, bytes = value.len(), "Record written");
        self.notify(key, ChangeKind::Set);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        match fs::remove_file(self.value_path(key)).await {
            Ok(()) => {
                self.sync_root().await;
                self.notify(key, ChangeKind::Removed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::storage_err("remove", key, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Self::storage_err("list", "<root>", e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::storage_err("list", "<root>", e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(&format!(".{}", VALUE_EXTENSION)) {
                if validate_key(key).is_ok() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
