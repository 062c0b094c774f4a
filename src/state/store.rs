//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::ManagerState;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the manager state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<ManagerState>>;

    /// Saves the manager state.
    async fn save(&self, state: &ManagerState) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `purpose`.
    async fn acquire_lock(&self, holder: &str, purpose: &str) -> Result<LockInfo>;

    /// Releases the state lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
