//! Restore marker file.
//!
//! The marker exists for the whole duration of a restore run. Status
//! queries only look at its presence, never at the restore execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, RestoreError, Result};

/// Whether a restore is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// The marker file exists.
    Running,
    /// No marker file.
    NotRunning,
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::NotRunning => "not_running",
        })
    }
}

/// Content of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerInfo {
    /// Process running the restore.
    pub holder: String,
    /// Restore execution.
    pub execution_id: String,
    /// Snapshot being restored.
    pub snapshot_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// Handle on the marker file path.
#[derive(Debug, Clone)]
pub struct RestoreMarker {
    path: PathBuf,
}

impl RestoreMarker {
    /// Creates a handle.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the marker file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RestoreStatus {
        if self.path.exists() {
            RestoreStatus::Running
        } else {
            RestoreStatus::NotRunning
        }
    }

    /// Creates the marker.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the marker exists.
    pub async fn begin(&self, info: &MarkerInfo) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(info)
            .map_err(|e| ManagerError::internal(e.to_string()))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(RestoreError::AlreadyRunning {
                    marker: self.path.clone(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&content).await?;
        file.sync_all().await?;

        info!(
            "Restore marker written for snapshot {} at {}",
            info.snapshot_id,
            self.path.display()
        );
        Ok(())
    }

    /// Rewrites the content of a marker created by [`Self::begin`].
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub async fn update(&self, info: &MarkerInfo) -> Result<()> {
        let content = serde_json::to_vec_pretty(info)
            .map_err(|e| ManagerError::internal(e.to_string()))?;
        fs::write(&self.path, content).await?;
        debug!("Restore marker now tracks execution {}", info.execution_id);
        Ok(())
    }

    /// Reads the marker, if present. An unreadable marker still counts as
    /// present for [`Self::status`].
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be read.
    pub async fn read(&self) -> Result<Option<MarkerInfo>> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!("Unreadable restore marker {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    /// Removes the marker; a missing marker is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Restore marker removed: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MarkerInfo {
        MarkerInfo {
            holder: String::from("host-1-abcd"),
            execution_id: String::from("exec"),
            snapshot_id: String::from("snap"),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let marker = RestoreMarker::new(dir.path().join("restore.marker"));
        assert_eq!(marker.status(), RestoreStatus::NotRunning);

        marker.begin(&info()).await.unwrap();
        assert_eq!(marker.status(), RestoreStatus::Running);
        assert_eq!(marker.read().await.unwrap().unwrap().snapshot_id, "snap");

        let err = marker.begin(&info()).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        marker.clear().await.unwrap();
        marker.clear().await.unwrap();
        assert_eq!(marker.status(), RestoreStatus::NotRunning);
        assert!(marker.read().await.unwrap().is_none());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(
            serde_json::to_string(&RestoreStatus::NotRunning).unwrap(),
            "\"not_running\""
        );
        assert_eq!(RestoreStatus::Running.to_string(), "running");
    }
}
