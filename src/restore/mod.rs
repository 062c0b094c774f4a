//! Snapshot restore.
//!
//! This module handles everything between an uploaded snapshot archive and
//! a restored manager:
//! - Reading and writing versioned snapshot archives
//! - Migrating records of older versions to the current shapes
//! - The restore marker reporting whether a restore is in flight
//! - The orchestrator importing tables and installing plugins

pub mod dump;
mod marker;
mod migrate;
mod orchestrator;
mod tables;
mod version;

pub use dump::{SnapshotDump, SnapshotMetadata};
pub use marker::{MarkerInfo, RestoreMarker, RestoreStatus};
pub use migrate::{INTERRUPTED_MESSAGE, MISSED_SCHEDULE_MESSAGE, Migrator};
pub use orchestrator::{
    PluginFailure, RestoreHandle, RestoreOptions, RestoreReport, SnapshotRestorer,
};
pub use tables::{
    AGENTS, BLUEPRINTS, DEPENDENCIES, DEPLOYMENTS, EVENTS, EXECUTIONS, NODE_INSTANCES, PLUGINS,
    PlainSecret, SECRETS, TENANTS, TableData,
};
pub use version::ManagerVersion;
