//! Expiring lock files.
//!
//! A lock file guards the state directory against concurrent CLI processes.
//! It names its holder so a blocked process can report who holds it; an
//! expired lock may be taken over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing.
    #[serde(default)]
    pub purpose: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info expiring after [`LOCK_EXPIRY_SECS`].
    #[must_use]
    pub fn new(holder: &str, purpose: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            purpose: purpose.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// A lock file at a fixed path.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Creates a handle; nothing is written until [`Self::acquire`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current lock, expired or not.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the file exists but cannot be parsed.
    pub async fn read(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            }
            .into()
        })
    }

    /// Takes the lock for `holder`, generating a holder id if empty.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if an unexpired lock exists.
    pub async fn acquire(&self, holder: &str, purpose: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock of {} found, taking over", existing.holder);
        }

        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder, purpose);
        self.write(&info).await?;

        info!(
            "Acquired lock {} for {purpose} (expires in {LOCK_EXPIRY_SECS}s)",
            info.lock_id
        );
        Ok(info)
    }

    /// Releases the lock if `lock_id` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `LockFailed` if the file cannot be removed.
    pub async fn release(&self, lock_id: &str) -> Result<()> {
        match self.read().await? {
            Some(existing) if existing.lock_id == lock_id => {
                fs::remove_file(&self.path).await.map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
                info!("Released lock {lock_id}");
            }
            Some(existing) => {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
            None => {}
        }
        Ok(())
    }

    /// Returns true if an unexpired lock exists.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the file cannot be parsed.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.read().await?.is_some_and(|info| !info.is_expired()))
    }

    async fn write(&self, info: &LockInfo) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let lock_failed = |e: std::io::Error| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        };
        let mut file = fs::File::create(&self.path).await.map_err(lock_failed)?;
        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;
        Ok(())
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("state.lock"));

        let info = lock.acquire("cli", "restore").await.unwrap();
        assert!(lock.is_locked().await.unwrap());
        assert_eq!(lock.read().await.unwrap().unwrap().purpose, "restore");
        assert!(info.remaining_secs() > 0);

        lock.release("someone-else").await.unwrap();
        assert!(lock.is_locked().await.unwrap());

        lock.release(&info.lock_id).await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_names_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("state.lock"));
        lock.acquire("holder-1", "update").await.unwrap();

        let err = lock.acquire("holder-2", "update").await.unwrap_err();
        assert!(err.to_string().contains("holder-1"));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("state.lock"));
        let mut stale = LockInfo::new("gone", "update");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        lock.write(&stale).await.unwrap();

        assert!(!lock.is_locked().await.unwrap());
        let info = lock.acquire("", "update").await.unwrap();
        assert!(info.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_release_without_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("missing.lock"));
        tokio_test::assert_ok!(tokio_test::block_on(lock.release("any")));
        tokio_test::assert_ok!(tokio_test::block_on(lock.is_locked()));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
