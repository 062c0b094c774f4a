//! Manager collaborators.
//!
//! This module provides:
//! - The async contracts the orchestrators call (deployments, executions,
//!   secrets, plugins, maintenance, snapshots and friends)
//! - The records exchanged through them
//! - The secret cipher used for values at rest
//! - Two backends: the in-process [`LocalManager`] and the HTTP
//!   [`RestClient`]

mod api;
mod crypto;
mod local;
mod rest;
mod types;

pub use api::{
    BlueprintsApi, DeploymentUpdatesApi, DeploymentsApi, EventsApi, ExecutionsApi, ImportSink,
    MaintenanceApi, ManagerClients, PluginsApi, RuntimeStore, SecretsApi, SnapshotsApi,
};
pub use crypto::SecretCipher;
pub use local::{LocalManager, SimulatedOutcome};
pub use rest::RestClient;
pub use types::{
    AGENT_STATE_RESTORED, Agent, AuditEntry, Blueprint, CREATE_ENVIRONMENT_WORKFLOW,
    DEFAULT_TENANT, DELETE_ENVIRONMENT_WORKFLOW, Deployment, Event, EventKind, Execution,
    InterDeploymentDependency, MaintenanceMode, NodeInstance, Plugin, PurgeOutcome, PurgeRequest,
    RESTORE_WORKFLOW, Secret, SecretOptions, SecretView, Snapshot, SnapshotStatus,
    StartExecution, Tenant, Visibility, WORKFLOW_EVENT_TYPE,
};

#[cfg(test)]
pub use api::{
    MockBlueprintsApi, MockDeploymentUpdatesApi, MockDeploymentsApi, MockEventsApi,
    MockExecutionsApi, MockImportSink, MockMaintenanceApi, MockPluginsApi, MockRuntimeStore,
    MockSecretsApi, MockSnapshotsApi,
};
