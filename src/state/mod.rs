//! State management for the local manager.
//!
//! This module provides persistent storage of the manager tables and the
//! lock file guarding them against concurrent processes.

mod local;
mod lock;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockFile, LockInfo, generate_holder_id};
pub use store::StateStore;
pub use types::{ManagerState, STATE_VERSION};
