//! Manager record types.
//!
//! These are the records exchanged with the manager collaborators and
//! stored in snapshot tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::execution::ExecutionStatus;
use crate::topology::Topology;

/// Name of the tenant used when none is given.
pub const DEFAULT_TENANT: &str = "default_tenant";

/// Workflow that creates a deployment's environment.
pub const CREATE_ENVIRONMENT_WORKFLOW: &str = "create_deployment_environment";

/// Workflow that deletes a deployment's environment.
pub const DELETE_ENVIRONMENT_WORKFLOW: &str = "delete_deployment_environment";

/// Workflow of the restore execution.
pub const RESTORE_WORKFLOW: &str = "restore_snapshot";

/// Event type every event purge must include.
pub const WORKFLOW_EVENT_TYPE: &str = "stratus_event";

fn default_tenant() -> String {
    String::from(DEFAULT_TENANT)
}

/// Visibility of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to its creator only.
    Private,
    /// Visible to the whole tenant.
    #[default]
    Tenant,
    /// Visible to every tenant.
    Global,
}

/// A tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant name.
    pub name: String,
}

/// An uploaded blueprint revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Blueprint id.
    pub id: String,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Topology declared by the blueprint.
    pub topology: Topology,
    /// Blueprints imported by this one; protects them from deletion.
    #[serde(default)]
    pub imported_blueprints: Vec<String>,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// A deployment of a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment id.
    pub id: String,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Blueprint the deployment was created from.
    pub blueprint_id: String,
    /// Deployment inputs.
    #[serde(default)]
    pub inputs: Value,
    /// Current topology.
    pub topology: Topology,
    /// Whether intrinsic functions are only evaluated at runtime.
    #[serde(default)]
    pub runtime_only_evaluation: bool,
    /// Visibility.
    #[serde(default)]
    pub visibility: Visibility,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// One instance of a topology node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Instance id.
    pub id: String,
    /// Owning deployment.
    pub deployment_id: String,
    /// Node the instance belongs to.
    pub node_id: String,
    /// 1-based index of the instance within its node.
    #[serde(default)]
    pub index: u32,
    /// Lifecycle state.
    #[serde(default)]
    pub state: String,
    /// Runtime properties.
    #[serde(default)]
    pub runtime_properties: BTreeMap<String, Value>,
}

/// A workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution id.
    pub id: String,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Target deployment, if any.
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Blueprint of the target deployment.
    #[serde(default)]
    pub blueprint_id: Option<String>,
    /// Workflow name.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Workflow parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Error message for failed executions.
    #[serde(default)]
    pub error: String,
    /// Token the workflow uses to call back into the manager.
    #[serde(default)]
    pub token: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the execution should start, for scheduled executions.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// End time.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Request to start an execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartExecution {
    /// Target deployment, if any.
    pub deployment_id: Option<String>,
    /// Workflow name.
    pub workflow_id: String,
    /// Workflow parameters.
    pub parameters: Value,
    /// Generate a callback token for the execution.
    pub with_token: bool,
    /// Create the execution even in maintenance mode.
    pub bypass_maintenance: bool,
}

impl StartExecution {
    /// Starts `workflow_id` on `deployment_id`.
    #[must_use]
    pub fn on_deployment(deployment_id: &str, workflow_id: &str, parameters: Value) -> Self {
        Self {
            deployment_id: Some(deployment_id.to_string()),
            workflow_id: workflow_id.to_string(),
            parameters,
            ..Self::default()
        }
    }
}

/// Kind of an event table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Workflow event.
    Event,
    /// Log line.
    Log,
}

/// An event or log line emitted by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Row id.
    pub id: String,
    /// Event or log.
    pub kind: EventKind,
    /// Deployment the execution ran on.
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Emitting execution.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Event type (events) or level (logs).
    pub event_type: String,
    /// Message.
    pub message: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

/// An entry of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Operation name.
    pub operation: String,
    /// Description.
    pub message: String,
    /// Who performed the operation.
    pub actor: String,
    /// Time of the operation.
    pub timestamp: DateTime<Utc>,
}

/// A stored secret. The value is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Secret key.
    pub key: String,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Encrypted value.
    pub value: String,
    /// Visibility.
    #[serde(default)]
    pub visibility: Visibility,
    /// Whether the value is hidden from users without access.
    #[serde(default)]
    pub is_hidden_value: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// A secret as returned by `get`, with the value decrypted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretView {
    /// Secret key.
    pub key: String,
    /// Plaintext value.
    pub value: String,
    /// Whether the value is hidden from users without access.
    pub is_hidden_value: bool,
    /// Visibility.
    pub visibility: Visibility,
}

impl fmt::Debug for SecretView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretView")
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .field("is_hidden_value", &self.is_hidden_value)
            .field("visibility", &self.visibility)
            .finish()
    }
}

/// Options of a secret creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecretOptions {
    /// Replace the value of an existing secret instead of failing.
    pub update_if_exists: bool,
    /// Hide the value from users without access.
    pub is_hidden_value: bool,
    /// Visibility.
    pub visibility: Visibility,
}

/// An installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Plugin id.
    pub id: String,
    /// Owning tenant.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Package name.
    pub package_name: String,
    /// Package version.
    #[serde(default)]
    pub package_version: String,
    /// Name of the wagon file.
    #[serde(default)]
    pub archive_name: String,
    /// Upload time.
    pub uploaded_at: DateTime<Utc>,
}

/// A worker agent attached to a node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Agent id.
    pub id: String,
    /// Agent name.
    pub name: String,
    /// Node instance hosting the agent.
    pub node_instance_id: String,
    /// Deployment of the node instance.
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Agent state.
    pub state: String,
    /// Agent version.
    #[serde(default)]
    pub version: String,
    /// Message broker exchange.
    #[serde(default)]
    pub broker_exchange: Option<String>,
    /// Message broker username.
    #[serde(default)]
    pub broker_username: Option<String>,
    /// Message broker password.
    #[serde(default)]
    pub broker_password: Option<String>,
}

/// State given to agents brought back by a restore.
pub const AGENT_STATE_RESTORED: &str = "restored";

/// A dependency between two deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterDeploymentDependency {
    /// Dependency id.
    pub id: String,
    /// Dependent deployment.
    pub source_deployment_id: String,
    /// Deployment depended upon.
    #[serde(default)]
    pub target_deployment_id: Option<String>,
    /// What created the dependency.
    pub dependency_creator: String,
}

/// Lifecycle of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Being created.
    Creating,
    /// Created on this manager.
    Created,
    /// Uploaded from elsewhere.
    Uploaded,
    /// Creation failed.
    Failed,
}

impl SnapshotStatus {
    /// Returns true if a restore may start from this snapshot.
    #[must_use]
    pub const fn is_restorable(self) -> bool {
        matches!(self, Self::Created | Self::Uploaded)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A snapshot known to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: String,
    /// Status.
    pub status: SnapshotStatus,
    /// Creation or upload time.
    pub created_at: DateTime<Utc>,
    /// Error message for failed snapshots.
    #[serde(default)]
    pub error: String,
}

/// Manager-wide maintenance state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceMode {
    /// Executions may start.
    #[default]
    Deactivated,
    /// New executions are rejected.
    Activated,
}

/// Request to purge the events of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    /// Deployment whose events are purged.
    pub deployment_id: String,
    /// Event types to delete; must include [`WORKFLOW_EVENT_TYPE`].
    pub event_types: Vec<String>,
    /// Also delete logs.
    pub include_logs: bool,
    /// Write deleted rows to a file under this directory first.
    pub store_before: Option<std::path::PathBuf>,
    /// Who requested the purge.
    pub actor: String,
}

/// Outcome of an event purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    /// Number of deleted rows.
    pub deleted: usize,
    /// Files the rows were stored to.
    pub stored_to: Vec<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_view_debug_redacts() {
        let view = SecretView {
            key: String::from("db_password"),
            value: String::from("hunter2"),
            is_hidden_value: true,
            visibility: Visibility::Tenant,
        };
        let rendered = format!("{view:?}");
        assert!(rendered.contains("db_password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_snapshot_restorable() {
        assert!(SnapshotStatus::Uploaded.is_restorable());
        assert!(SnapshotStatus::Created.is_restorable());
        assert!(!SnapshotStatus::Creating.is_restorable());
        assert!(!SnapshotStatus::Failed.is_restorable());
    }
}
