//! Error types for the Stratus manager core.
//!
//! Every failure surfaced by an orchestration flow belongs to one of the
//! kinds in [`ErrorKind`]. Collaborator failures (storage, transport) are
//! wrapped into the domain errors below with deployment, update or restore
//! context attached, so callers never see a raw transport error.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the Stratus manager core.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State persistence errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Errors returned by a manager collaborator (storage or REST).
    #[error("Manager client error: {0}")]
    Client(#[from] ClientError),

    /// Topology diff errors.
    #[error("Diff error: {0}")]
    Diff(#[from] DiffError),

    /// Deployment update errors.
    #[error("Deployment update error: {0}")]
    Update(#[from] UpdateError),

    /// Component provisioning errors.
    #[error("Component error: {0}")]
    Component(#[from] ComponentError),

    /// Snapshot restore errors.
    #[error("Restore error: {0}")]
    Restore(#[from] RestoreError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of errors, shared by every flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected synchronously and never retried.
    Validation,
    /// The target resource exists in an incompatible state.
    Conflict,
    /// A referenced resource is absent.
    NotFound,
    /// A polling deadline was exceeded.
    Timeout,
    /// Underlying transport or storage failure.
    Transport,
    /// A tolerated per-record failure (plugin install).
    PartialFailure,
    /// Anything else.
    Internal,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A setting is store-backed and has not been loaded yet.
    #[error("Setting '{name}' has not been loaded from the config store")]
    NotLoaded {
        /// Setting name.
        name: String,
    },

    /// The setting name is not part of the registry.
    #[error("Unknown setting: {name}")]
    UnknownSetting {
        /// Setting name.
        name: String,
    },

    /// No persisted config entry matches the name.
    #[error("Config entry not found: {name}")]
    EntryNotFound {
        /// Requested name.
        name: String,
    },

    /// Several persisted config entries match the name.
    #[error("Expected 1 value, but found {count}")]
    AmbiguousName {
        /// Number of matching entries.
        count: usize,
    },

    /// The entry cannot be edited without force.
    #[error("{name} is not editable")]
    NotEditable {
        /// Entry name.
        name: String,
    },

    /// The value violates the entry schema.
    #[error("Invalid value for {name}: {message}")]
    SchemaViolation {
        /// Entry name.
        name: String,
        /// Description of the violation.
        message: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// State persistence errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Secret encryption or decryption failed.
    #[error("Secret cipher error: {message}")]
    Cipher {
        /// Description of the cipher failure.
        message: String,
    },
}

/// Errors returned by manager collaborators.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The requested resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource type.
        resource: String,
        /// Resource identifier.
        id: String,
    },

    /// The resource already exists or is in an incompatible state.
    #[error("Conflict on {resource} '{id}': {message}")]
    Conflict {
        /// Resource type.
        resource: String,
        /// Resource identifier.
        id: String,
        /// Description of the conflict.
        message: String,
    },

    /// The request was malformed.
    #[error("Bad request: {message}")]
    BadRequest {
        /// Description of the problem.
        message: String,
    },

    /// The manager is in maintenance mode.
    #[error("Manager is in maintenance mode: {message}")]
    Maintenance {
        /// Description of the rejected action.
        message: String,
    },

    /// API request failed.
    #[error("Manager API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Rate limited.
    #[error("Manager API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error communicating with the manager: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the API.
    #[error("Invalid response from the manager: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Topology diff errors.
#[derive(Debug, Error)]
pub enum DiffError {
    /// A topology failed validation.
    #[error("Malformed {side} topology: {message}")]
    MalformedTopology {
        /// Which side of the diff ("old" or "new").
        side: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A node changed its type between revisions.
    #[error("Node '{node_id}' changed type from '{old_type}' to '{new_type}'")]
    NodeTypeChanged {
        /// Node identifier.
        node_id: String,
        /// Previous type.
        old_type: String,
        /// New type.
        new_type: String,
    },

    /// A step could not be applied to a topology.
    #[error("Cannot apply step {entity_id}: {message}")]
    InvalidStep {
        /// Entity path of the step.
        entity_id: String,
        /// Description of the problem.
        message: String,
    },
}

/// Deployment update errors.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The update workflow execution failed.
    #[error("Update {update_id} of deployment '{deployment_id}' failed: execution {execution_id} ended with status {status}")]
    ExecutionFailed {
        /// Update identifier.
        update_id: String,
        /// Deployment identifier.
        deployment_id: String,
        /// Execution identifier.
        execution_id: String,
        /// Final execution status.
        status: String,
    },

    /// The update workflow execution disappeared.
    #[error("Update {update_id} of deployment '{deployment_id}' failed: execution {execution_id} not found")]
    ExecutionNotFound {
        /// Update identifier.
        update_id: String,
        /// Deployment identifier.
        deployment_id: String,
        /// Execution identifier.
        execution_id: String,
    },

    /// Waiting for the update workflow exceeded the deadline.
    #[error("Update {update_id} of deployment '{deployment_id}': Execution timed out after {timeout:?} (execution {execution_id})")]
    Timeout {
        /// Update identifier.
        update_id: String,
        /// Deployment identifier.
        deployment_id: String,
        /// Execution identifier.
        execution_id: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// A state transition was rejected.
    #[error("Invalid update state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A step of the finalize phase failed.
    #[error("Update {update_id} of deployment '{deployment_id}' failed while finalizing {entity_id}: {reason}")]
    FinalizeFailed {
        /// Update identifier.
        update_id: String,
        /// Deployment identifier.
        deployment_id: String,
        /// Entity path of the failing step.
        entity_id: String,
        /// Cause.
        reason: String,
    },

    /// Any other failure while the update was in flight.
    #[error("Update {update_id} of deployment '{deployment_id}' failed: {reason}")]
    Aborted {
        /// Update identifier.
        update_id: String,
        /// Deployment identifier.
        deployment_id: String,
        /// Cause.
        reason: String,
    },
}

/// Component provisioning errors.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// The `plugins` property is not a mapping.
    #[error("Wrong type in plugins: {value}")]
    WrongPluginsType {
        /// Rendered offending value.
        value: String,
    },

    /// A plugin entry is missing one of its paths.
    #[error("Plugin '{name}': You should provide both values wagon_path: '{wagon_path}' and plugin_yaml_path: '{plugin_yaml_path}'")]
    IncompletePlugin {
        /// Plugin entry name.
        name: String,
        /// Given wagon path.
        wagon_path: String,
        /// Given plugin yaml path.
        plugin_yaml_path: String,
    },

    /// A component property is malformed.
    #[error("Invalid component property '{field}': {message}")]
    InvalidProperty {
        /// Property name.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// A collaborator call failed.
    #[error("Client action \"{action}\" failed for deployment '{deployment_id}': {reason}")]
    ActionFailed {
        /// Action name ("create" or "delete").
        action: &'static str,
        /// Nested deployment identifier.
        deployment_id: String,
        /// Underlying cause.
        reason: String,
    },

    /// No environment-creation execution exists for the nested deployment.
    #[error("No execution found for component \"{deployment_id}\" deployment")]
    ExecutionNotFound {
        /// Nested deployment identifier.
        deployment_id: String,
    },

    /// The environment-creation execution ended unsuccessfully.
    #[error("Execution {execution_id} of component \"{deployment_id}\" ended with status {status}")]
    ExecutionFailed {
        /// Nested deployment identifier.
        deployment_id: String,
        /// Execution identifier.
        execution_id: String,
        /// Final status.
        status: String,
    },

    /// Waiting for the nested deployment exceeded the deadline.
    #[error("Execution timed out after {timeout:?} while waiting for \"{operation}\" of deployment '{deployment_id}'")]
    Timeout {
        /// Operation awaited.
        operation: String,
        /// Nested deployment identifier.
        deployment_id: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// Fetching or archiving a plugin artifact failed.
    #[error("Failed to prepare plugin '{name}': {reason}")]
    ArtifactFailed {
        /// Plugin entry name.
        name: String,
        /// Cause.
        reason: String,
    },
}

/// Snapshot restore errors.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Snapshot is not in a restorable state.
    #[error("Snapshot {snapshot_id} is {status}, expected uploaded")]
    NotRestorable {
        /// Snapshot identifier.
        snapshot_id: String,
        /// Current status.
        status: String,
    },

    /// A restore is already in progress.
    #[error("A snapshot restore is already running (marker: {marker})")]
    AlreadyRunning {
        /// Path of the marker file.
        marker: PathBuf,
    },

    /// The snapshot archive could not be read.
    #[error("Invalid snapshot archive: {message}")]
    InvalidArchive {
        /// Description of the problem.
        message: String,
    },

    /// The snapshot was produced by an unsupported version.
    #[error("Snapshot version {version} is not supported (supported: {oldest} to {current})")]
    UnsupportedVersion {
        /// Producing version.
        version: String,
        /// Oldest supported version.
        oldest: String,
        /// Current version.
        current: String,
    },

    /// A record could not be migrated to the current shape.
    #[error("Failed to migrate {table} record '{id}': {message}")]
    Migration {
        /// Table name.
        table: &'static str,
        /// Record identifier.
        id: String,
        /// Description of the problem.
        message: String,
    },

    /// Importing a table failed.
    #[error("Failed to import table {table}: {message}")]
    ImportFailed {
        /// Table name.
        table: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A plugin failed to install and failures are not tolerated.
    #[error("Failed to install plugin '{plugin_id}': {message}")]
    PluginInstallFailed {
        /// Plugin identifier.
        plugin_id: String,
        /// Description of the problem.
        message: String,
    },

    /// Waiting for the restore execution exceeded the deadline.
    #[error("Restore execution {execution_id}: Execution timed out after {timeout:?}")]
    Timeout {
        /// Execution identifier.
        execution_id: String,
        /// Configured timeout.
        timeout: Duration,
    },
}

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

impl ManagerError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies this error into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => match e {
                ConfigError::EntryNotFound { .. } | ConfigError::FileNotFound { .. } => {
                    ErrorKind::NotFound
                }
                ConfigError::AmbiguousName { .. }
                | ConfigError::NotEditable { .. }
                | ConfigError::SchemaViolation { .. } => ErrorKind::Conflict,
                _ => ErrorKind::Validation,
            },
            Self::State(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Client(e) => match e {
                ClientError::NotFound { .. } => ErrorKind::NotFound,
                ClientError::Conflict { .. } | ClientError::Maintenance { .. } => {
                    ErrorKind::Conflict
                }
                ClientError::BadRequest { .. } => ErrorKind::Validation,
                _ => ErrorKind::Transport,
            },
            Self::Diff(_) => ErrorKind::Validation,
            Self::Update(e) => match e {
                UpdateError::Timeout { .. } => ErrorKind::Timeout,
                UpdateError::ExecutionNotFound { .. } => ErrorKind::NotFound,
                UpdateError::InvalidTransition { .. } => ErrorKind::Conflict,
                _ => ErrorKind::Internal,
            },
            Self::Component(e) => match e {
                ComponentError::WrongPluginsType { .. }
                | ComponentError::IncompletePlugin { .. }
                | ComponentError::InvalidProperty { .. } => ErrorKind::Validation,
                ComponentError::ExecutionNotFound { .. } => ErrorKind::NotFound,
                ComponentError::Timeout { .. } => ErrorKind::Timeout,
                ComponentError::ActionFailed { .. } | ComponentError::ArtifactFailed { .. } => {
                    ErrorKind::Transport
                }
                ComponentError::ExecutionFailed { .. } => ErrorKind::Internal,
            },
            Self::Restore(e) => match e {
                RestoreError::NotRestorable { .. } | RestoreError::AlreadyRunning { .. } => {
                    ErrorKind::Conflict
                }
                RestoreError::InvalidArchive { .. }
                | RestoreError::UnsupportedVersion { .. }
                | RestoreError::Migration { .. } => ErrorKind::Validation,
                RestoreError::PluginInstallFailed { .. } => ErrorKind::PartialFailure,
                RestoreError::Timeout { .. } => ErrorKind::Timeout,
                RestoreError::ImportFailed { .. } => ErrorKind::Transport,
            },
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for transport errors a tolerant poller may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Client(ClientError::ApiRequestFailed { status, .. }) => *status >= 500,
            Self::Client(ClientError::RateLimited { .. } | ClientError::NetworkError { .. }) => {
                true
            }
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Client(ClientError::RateLimited { retry_after_secs }) => Some(*retry_after_secs),
            Self::Client(ClientError::NetworkError { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a parse error with an optional location.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: Option<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location,
        }
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a cipher error with the given message.
    #[must_use]
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher {
            message: message.into(),
        }
    }
}

impl ClientError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(
        resource: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource: resource.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}

impl DiffError {
    /// Creates a malformed-topology error.
    #[must_use]
    pub fn malformed(side: &'static str, message: impl Into<String>) -> Self {
        Self::MalformedTopology {
            side,
            message: message.into(),
        }
    }

    /// Creates an invalid-step error.
    #[must_use]
    pub fn invalid_step(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStep {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }
}

impl RestoreError {
    /// Creates an invalid-archive error.
    #[must_use]
    pub fn archive(message: impl Into<String>) -> Self {
        Self::InvalidArchive {
            message: message.into(),
        }
    }
}
