//! Local file-based state storage backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::lock::{LockFile, LockInfo};
use super::store::StateStore;
use super::types::ManagerState;
use crate::error::{Result, StateError};

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock: LockFile,
}

impl LocalStateStore {
    /// Creates a store keeping its files under `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock: LockFile::new(base_dir.join(LOCK_FILE)),
            base_dir,
        }
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::WriteFailed {
                    message: format!("Failed to create state directory: {e}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ManagerState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());
        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })?;
        let state = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state file: {e}"),
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &ManagerState) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let write_failed = |e: std::io::Error| StateError::WriteFailed {
            message: format!("Failed to write state file: {e}"),
        };

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(write_failed)?;
        file.write_all(content.as_bytes())
            .await
            .map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(write_failed)?;

        debug!("State saved to {}", self.state_path.display());
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, purpose: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        self.lock.acquire(holder, purpose).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        self.lock.release(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.read().await?.filter(|info| !info.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

impl LocalStateStore {
    /// Loads the state, creating and saving a fresh one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    pub async fn load_or_init(
        &self,
        init: impl FnOnce() -> ManagerState + Send,
    ) -> Result<ManagerState> {
        if let Some(state) = self.load().await? {
            return Ok(state);
        }
        info!("Initializing new state in {}", self.base_dir.display());
        let state = init();
        self.save(&state).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join("state"));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let state = ManagerState::new("test-key");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");
        assert_eq!(loaded.encryption_key, "test-key");
        assert_eq!(loaded.tenants.len(), 1);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_load_or_init_only_inits_once() {
        let (store, _temp) = create_test_store();
        let first = store.load_or_init(|| ManagerState::new("k1")).await.unwrap();
        let second = store.load_or_init(|| ManagerState::new("k2")).await.unwrap();
        assert_eq!(first.encryption_key, "k1");
        assert_eq!(second.encryption_key, "k1");
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.base_dir()).unwrap();
        std::fs::write(store.base_dir().join(STATE_FILE), "{not json").unwrap();
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "restore")
            .await
            .expect("Failed to acquire lock");
        assert!(store.get_lock_info().await.unwrap().is_some());
        assert!(store.acquire_lock("other", "update").await.is_err());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.get_lock_info().await.unwrap().is_none());
    }
}
