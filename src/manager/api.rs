//! Collaborator contracts of the orchestration core.
//!
//! The orchestrators only talk to the manager through these traits. The
//! in-process [`super::LocalManager`] and the HTTP [`super::RestClient`]
//! implement them; tests use the generated mocks.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::types::{
    AuditEntry, Blueprint, Deployment, Execution, MaintenanceMode, NodeInstance, Plugin,
    PurgeOutcome, PurgeRequest, SecretOptions, SecretView, Snapshot, StartExecution,
};
use crate::error::Result;
use crate::execution::ExecutionStatus;
use crate::restore::TableData;
use crate::topology::Topology;
use crate::update::DeploymentUpdate;

/// Blueprint operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlueprintsApi: Send + Sync {
    /// Stores a blueprint; `Conflict` if the id is taken.
    async fn upload(&self, blueprint_id: &str, topology: Topology) -> Result<Blueprint>;

    /// Fetches a blueprint; `NotFound` when absent.
    async fn get(&self, blueprint_id: &str) -> Result<Blueprint>;

    /// Lists blueprints.
    async fn list(&self) -> Result<Vec<Blueprint>>;
}

/// Deployment operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentsApi: Send + Sync {
    /// Creates a deployment and starts its environment-creation execution.
    async fn create(&self, deployment_id: &str, blueprint_id: &str, inputs: Value)
        -> Result<Deployment>;

    /// Deletes a deployment.
    async fn delete(&self, deployment_id: &str) -> Result<()>;

    /// Fetches a deployment; `NotFound` when absent.
    async fn get(&self, deployment_id: &str) -> Result<Deployment>;

    /// Lists deployments.
    async fn list(&self) -> Result<Vec<Deployment>>;

    /// Replaces the persisted topology of a deployment.
    async fn set_topology(&self, deployment_id: &str, topology: Topology) -> Result<()>;
}

/// Execution operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionsApi: Send + Sync {
    /// Starts an execution.
    async fn start(&self, request: StartExecution) -> Result<Execution>;

    /// Fetches an execution; `NotFound` when absent.
    async fn get(&self, execution_id: &str) -> Result<Execution>;

    /// Lists the executions of a deployment.
    async fn list(&self, deployment_id: &str) -> Result<Vec<Execution>>;

    /// Sets the status of an execution.
    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: String,
    ) -> Result<Execution>;
}

/// Secret operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretsApi: Send + Sync {
    /// Creates a secret; `Conflict` if it exists unless `update_if_exists`.
    async fn create(&self, key: &str, value: &str, options: SecretOptions) -> Result<SecretView>;

    /// Deletes a secret.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetches a secret with its value decrypted.
    async fn get(&self, key: &str) -> Result<SecretView>;

    /// Lists secret keys.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Plugin operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginsApi: Send + Sync {
    /// Uploads a plugin archive (wagon plus plugin yaml).
    async fn upload(&self, archive: &Path) -> Result<Plugin>;

    /// Deletes a plugin.
    async fn delete(&self, plugin_id: &str) -> Result<()>;

    /// Lists installed plugins.
    async fn list(&self) -> Result<Vec<Plugin>>;
}

/// Maintenance mode switch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MaintenanceApi: Send + Sync {
    /// Rejects new executions from now on.
    async fn activate(&self) -> Result<()>;

    /// Accepts new executions again.
    async fn deactivate(&self) -> Result<()>;

    /// Current mode.
    async fn status(&self) -> Result<MaintenanceMode>;
}

/// Snapshot operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotsApi: Send + Sync {
    /// Fetches a snapshot; `NotFound` when absent.
    async fn get(&self, snapshot_id: &str) -> Result<Snapshot>;

    /// Lists snapshots.
    async fn list(&self) -> Result<Vec<Snapshot>>;

    /// Exports the current state into a new snapshot.
    async fn create(&self, snapshot_id: &str) -> Result<Snapshot>;

    /// Registers an archive produced elsewhere.
    async fn upload(&self, snapshot_id: &str, archive: &Path) -> Result<Snapshot>;

    /// Local path of the snapshot archive.
    async fn archive_path(&self, snapshot_id: &str) -> Result<PathBuf>;
}

/// Persistence of deployment update records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentUpdatesApi: Send + Sync {
    /// Inserts or replaces an update record.
    async fn save(&self, update: &DeploymentUpdate) -> Result<()>;

    /// Fetches an update record.
    async fn get(&self, update_id: &str) -> Result<DeploymentUpdate>;

    /// Lists the updates of a deployment, oldest first.
    async fn list(&self, deployment_id: &str) -> Result<Vec<DeploymentUpdate>>;
}

/// Runtime properties of node instances.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Lists the node instances of a deployment.
    async fn node_instances(&self, deployment_id: &str) -> Result<Vec<NodeInstance>>;

    /// Reads the runtime properties of a node instance.
    async fn get_runtime_properties(&self, node_instance_id: &str)
        -> Result<BTreeMap<String, Value>>;

    /// Replaces the runtime properties of a node instance.
    async fn set_runtime_properties(
        &self,
        node_instance_id: &str,
        properties: BTreeMap<String, Value>,
    ) -> Result<()>;
}

/// Destination of restored snapshot tables.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImportSink: Send + Sync {
    /// Imports a whole table; either every record lands or none does.
    async fn import_table(&self, table: TableData) -> Result<usize>;

    /// Installs one plugin from its wagon.
    async fn install_plugin(&self, plugin: Plugin, wagon: &Path) -> Result<()>;
}

/// Event and audit log operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventsApi: Send + Sync {
    /// Deletes the events (and optionally logs) of a deployment.
    async fn purge(&self, request: PurgeRequest) -> Result<PurgeOutcome>;

    /// Returns the audit log.
    async fn audit_log(&self) -> Result<Vec<AuditEntry>>;
}

/// Bundle of every collaborator handle, shared by the orchestrators.
#[derive(Clone)]
pub struct ManagerClients {
    /// Blueprints.
    pub blueprints: Arc<dyn BlueprintsApi>,
    /// Deployments.
    pub deployments: Arc<dyn DeploymentsApi>,
    /// Executions.
    pub executions: Arc<dyn ExecutionsApi>,
    /// Secrets.
    pub secrets: Arc<dyn SecretsApi>,
    /// Plugins.
    pub plugins: Arc<dyn PluginsApi>,
    /// Maintenance mode.
    pub maintenance: Arc<dyn MaintenanceApi>,
    /// Snapshots.
    pub snapshots: Arc<dyn SnapshotsApi>,
    /// Deployment update records.
    pub updates: Arc<dyn DeploymentUpdatesApi>,
    /// Node instance runtime properties.
    pub runtime: Arc<dyn RuntimeStore>,
    /// Restore destination.
    pub import: Arc<dyn ImportSink>,
    /// Events and audit log.
    pub events: Arc<dyn EventsApi>,
}

impl ManagerClients {
    /// Uses one backend for every contract.
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: BlueprintsApi
            + DeploymentsApi
            + ExecutionsApi
            + SecretsApi
            + PluginsApi
            + MaintenanceApi
            + SnapshotsApi
            + DeploymentUpdatesApi
            + RuntimeStore
            + ImportSink
            + EventsApi
            + 'static,
    {
        Self {
            blueprints: backend.clone(),
            deployments: backend.clone(),
            executions: backend.clone(),
            secrets: backend.clone(),
            plugins: backend.clone(),
            maintenance: backend.clone(),
            snapshots: backend.clone(),
            updates: backend.clone(),
            runtime: backend.clone(),
            import: backend.clone(),
            events: backend,
        }
    }
}

impl std::fmt::Debug for ManagerClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerClients").finish_non_exhaustive()
    }
}
