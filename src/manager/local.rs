//! In-process manager backend.
//!
//! `LocalManager` serves every collaborator contract from a
//! [`ManagerState`] persisted under its root directory. Each mutation runs
//! against a copy of the state that is only committed once it has been
//! saved, so a failed call leaves nothing behind.
//!
//! Workflow executions are simulated: every `get` moves an execution one
//! step along `pending -> started -> <outcome>`, where the outcome is
//! configured per workflow.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{
    BlueprintsApi, DeploymentUpdatesApi, DeploymentsApi, EventsApi, ExecutionsApi, ImportSink,
    MaintenanceApi, PluginsApi, RuntimeStore, SecretsApi, SnapshotsApi,
};
use super::crypto::SecretCipher;
use super::types::{
    AuditEntry, Blueprint, CREATE_ENVIRONMENT_WORKFLOW, DEFAULT_TENANT,
    DELETE_ENVIRONMENT_WORKFLOW, Deployment, Event, EventKind, Execution, MaintenanceMode,
    NodeInstance, Plugin, PurgeOutcome, PurgeRequest, RESTORE_WORKFLOW, Secret, SecretOptions,
    SecretView, Snapshot, SnapshotStatus, StartExecution, Tenant, Visibility,
    WORKFLOW_EVENT_TYPE,
};
use crate::component::archive::{inspect_wagon, unpack_plugin};
use crate::config::{ConfigEntry, ConfigStore, REST_SCOPE, SETTINGS, SettingsSource};
use crate::error::{ClientError, ManagerError, Result};
use crate::execution::ExecutionStatus;
use crate::restore::{self, ManagerVersion, SnapshotDump, TableData};
use crate::state::{LocalStateStore, ManagerState, StateStore};
use crate::topology::Topology;
use crate::update::DeploymentUpdate;

const STATE_DIR: &str = "state";
const PLUGINS_DIR: &str = "plugins";
const SNAPSHOTS_DIR: &str = "snapshots";

/// How a simulated workflow ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulatedOutcome {
    /// Ends `terminated`.
    #[default]
    Succeed,
    /// Ends `failed`.
    Fail,
    /// Stays `started` until someone sets its status.
    Hang,
}

fn not_found(resource: &str, id: &str) -> ManagerError {
    ClientError::not_found(resource, id).into()
}

fn bad_request(message: impl Into<String>) -> ManagerError {
    ClientError::BadRequest {
        message: message.into(),
    }
    .into()
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ManagerError::internal(format!("blocking task failed: {e}")))?
}

/// Config entries every new manager starts with.
fn default_config() -> ConfigStore {
    let mut store = ConfigStore::default();
    for def in SETTINGS.iter().filter(|def| def.from_store) {
        let value = serde_json::from_str(def.default).unwrap_or(Value::Null);
        store.insert(ConfigEntry::new(def.name, REST_SCOPE, value));
    }
    store
}

fn new_execution(state: &mut ManagerState, request: &StartExecution) -> Result<Execution> {
    if state.maintenance == MaintenanceMode::Activated && !request.bypass_maintenance {
        return Err(ClientError::Maintenance {
            message: format!("cannot start workflow {}", request.workflow_id),
        }
        .into());
    }

    let blueprint_id = match &request.deployment_id {
        Some(deployment_id) => Some(
            state
                .deployments
                .get(deployment_id)
                .ok_or_else(|| not_found("deployment", deployment_id))?
                .blueprint_id
                .clone(),
        ),
        None => None,
    };

    let execution = Execution {
        id: Uuid::new_v4().to_string(),
        tenant: String::from(DEFAULT_TENANT),
        deployment_id: request.deployment_id.clone(),
        blueprint_id,
        workflow_id: request.workflow_id.clone(),
        status: ExecutionStatus::Pending,
        parameters: request.parameters.clone(),
        error: String::new(),
        token: request.with_token.then(|| Uuid::new_v4().simple().to_string()),
        created_at: Utc::now(),
        scheduled_for: None,
        ended_at: None,
    };
    debug!(
        "Execution {} of {} created",
        execution.id, execution.workflow_id
    );
    state
        .executions
        .insert(execution.id.clone(), execution.clone());
    Ok(execution)
}

fn record_event(state: &mut ManagerState, execution: &Execution) {
    let message = format!("Workflow {}: {}", execution.workflow_id, execution.status);
    state.events.push(Event {
        id: Uuid::new_v4().to_string(),
        kind: EventKind::Event,
        deployment_id: execution.deployment_id.clone(),
        execution_id: Some(execution.id.clone()),
        event_type: String::from(WORKFLOW_EVENT_TYPE),
        message: message.clone(),
        timestamp: Utc::now(),
    });
    state.events.push(Event {
        id: Uuid::new_v4().to_string(),
        kind: EventKind::Log,
        deployment_id: execution.deployment_id.clone(),
        execution_id: Some(execution.id.clone()),
        event_type: String::from("info"),
        message,
        timestamp: Utc::now(),
    });
}

fn set_execution_status(
    state: &mut ManagerState,
    execution_id: &str,
    status: ExecutionStatus,
    error: String,
) -> Result<Execution> {
    let execution = state
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| not_found("execution", execution_id))?;
    execution.status = status;
    execution.error = error;
    if status.is_terminal() {
        execution.ended_at = Some(Utc::now());
    }
    let execution = execution.clone();
    record_event(state, &execution);
    Ok(execution)
}

const fn next_status(
    current: ExecutionStatus,
    outcome: SimulatedOutcome,
) -> Option<ExecutionStatus> {
    match current {
        ExecutionStatus::Pending | ExecutionStatus::Queued => Some(ExecutionStatus::Started),
        ExecutionStatus::Started => match outcome {
            SimulatedOutcome::Succeed => Some(ExecutionStatus::Terminated),
            SimulatedOutcome::Fail => Some(ExecutionStatus::Failed),
            SimulatedOutcome::Hang => None,
        },
        ExecutionStatus::Cancelling | ExecutionStatus::ForceCancelling => {
            Some(ExecutionStatus::Cancelled)
        }
        _ => None,
    }
}

/// Manager backend persisted in a local directory.
pub struct LocalManager {
    root: PathBuf,
    store: LocalStateStore,
    cipher: SecretCipher,
    state: RwLock<ManagerState>,
    outcomes: Mutex<BTreeMap<String, SimulatedOutcome>>,
}

impl std::fmt::Debug for LocalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LocalManager {
    /// Opens the manager rooted at `root`, initializing it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let store = LocalStateStore::with_base_dir(root.join(STATE_DIR));
        let state = store
            .load_or_init(|| {
                let mut state = ManagerState::new(&SecretCipher::generate().key());
                state.config = default_config();
                state
            })
            .await?;
        let cipher = SecretCipher::from_key(&state.encryption_key)?;

        let mut outcomes = BTreeMap::new();
        outcomes.insert(String::from(RESTORE_WORKFLOW), SimulatedOutcome::Hang);

        info!(
            "Opened local manager at {} ({} deployment(s))",
            root.display(),
            state.deployments.len()
        );
        Ok(Self {
            root,
            store,
            cipher,
            state: RwLock::new(state),
            outcomes: Mutex::new(outcomes),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State store backing this manager.
    #[must_use]
    pub const fn store(&self) -> &LocalStateStore {
        &self.store
    }

    /// Sets how executions of `workflow_id` end.
    pub fn set_outcome(&self, workflow_id: &str, outcome: SimulatedOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_id.to_string(), outcome);
    }

    fn outcome(&self, workflow_id: &str) -> SimulatedOutcome {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .copied()
            .unwrap_or_default()
    }

    /// Copy of the current state.
    pub async fn state(&self) -> ManagerState {
        self.state.read().await.clone()
    }

    /// Persisted config entries.
    pub async fn config_store(&self) -> ConfigStore {
        self.state.read().await.config.clone()
    }

    /// Updates persisted config entries.
    ///
    /// # Errors
    ///
    /// Returns the lookup, editability and schema errors of
    /// [`ConfigStore::apply_updates`].
    pub async fn update_config(
        &self,
        updates: Vec<(String, Value)>,
        updater: &str,
        force: bool,
    ) -> Result<Vec<ConfigEntry>> {
        let updater = updater.to_string();
        self.mutate(move |state| state.config.apply_updates(&updates, &updater, force))
            .await
    }

    fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(PLUGINS_DIR).join(plugin_id)
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.root
            .join(SNAPSHOTS_DIR)
            .join(snapshot_id)
            .join(format!("{snapshot_id}.tar"))
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut ManagerState) -> Result<T> + Send,
    {
        let mut guard = self.state.write().await;
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        draft.touch();
        self.store.save(&draft).await?;
        *guard = draft;
        Ok(value)
    }

    async fn store_plugin_file(&self, plugin: &Plugin, wagon: &Path) -> Result<()> {
        let dir = self.plugin_dir(&plugin.id);
        fs::create_dir_all(&dir).await?;
        fs::copy(wagon, dir.join(&plugin.archive_name)).await?;
        Ok(())
    }

    /// Returns the number of records written. Tenants and events that
    /// already exist are skipped; every other table is upserted by id.
    fn import_into(&self, state: &mut ManagerState, table: TableData) -> Result<usize> {
        let mut count = table.len();
        match table {
            TableData::Tenants(rows) => {
                let mut known: HashSet<String> =
                    state.tenants.iter().map(|t| t.name.clone()).collect();
                let before = state.tenants.len();
                state
                    .tenants
                    .extend(rows.into_iter().filter(|t| known.insert(t.name.clone())));
                count = state.tenants.len() - before;
            }
            TableData::Blueprints(rows) => {
                state
                    .blueprints
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
            TableData::Deployments(rows) => {
                state
                    .deployments
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
            TableData::NodeInstances(rows) => {
                state
                    .node_instances
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
            TableData::Secrets(rows) => {
                for secret in rows {
                    let value = self.cipher.encrypt(&secret.value)?;
                    state.secrets.insert(
                        secret.key.clone(),
                        Secret {
                            key: secret.key,
                            tenant: secret.tenant,
                            value,
                            visibility: secret.visibility,
                            is_hidden_value: secret.is_hidden_value,
                            created_at: secret.created_at,
                            updated_at: secret.updated_at,
                        },
                    );
                }
            }
            TableData::Executions(rows) => {
                state
                    .executions
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
            TableData::Events(rows) => {
                let mut known: HashSet<String> =
                    state.events.iter().map(|e| e.id.clone()).collect();
                let before = state.events.len();
                state
                    .events
                    .extend(rows.into_iter().filter(|e| known.insert(e.id.clone())));
                count = state.events.len() - before;
            }
            TableData::Agents(rows) => {
                state
                    .agents
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
            TableData::Dependencies(rows) => {
                state
                    .dependencies
                    .extend(rows.into_iter().map(|r| (r.id.clone(), r)));
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl BlueprintsApi for LocalManager {
    async fn upload(&self, blueprint_id: &str, topology: Topology) -> Result<Blueprint> {
        topology
            .validate()
            .map_err(|e| bad_request(format!("invalid blueprint {blueprint_id}: {e}")))?;
        let id = blueprint_id.to_string();
        self.mutate(move |state| {
            if state.blueprints.contains_key(&id) {
                return Err(ClientError::conflict("blueprint", &id, "already exists").into());
            }
            let blueprint = Blueprint {
                id: id.clone(),
                tenant: String::from(DEFAULT_TENANT),
                topology,
                imported_blueprints: Vec::new(),
                created_at: Utc::now(),
            };
            state.blueprints.insert(id, blueprint.clone());
            Ok(blueprint)
        })
        .await
    }

    async fn get(&self, blueprint_id: &str) -> Result<Blueprint> {
        self.state
            .read()
            .await
            .blueprints
            .get(blueprint_id)
            .cloned()
            .ok_or_else(|| not_found("blueprint", blueprint_id))
    }

    async fn list(&self) -> Result<Vec<Blueprint>> {
        Ok(self.state.read().await.blueprints.values().cloned().collect())
    }
}

#[async_trait]
impl DeploymentsApi for LocalManager {
    async fn create(
        &self,
        deployment_id: &str,
        blueprint_id: &str,
        inputs: Value,
    ) -> Result<Deployment> {
        let id = deployment_id.to_string();
        let blueprint_id = blueprint_id.to_string();
        self.mutate(move |state| {
            if state.deployments.contains_key(&id) {
                return Err(ClientError::conflict("deployment", &id, "already exists").into());
            }
            let blueprint = state
                .blueprints
                .get(&blueprint_id)
                .ok_or_else(|| not_found("blueprint", &blueprint_id))?;

            let now = Utc::now();
            let deployment = Deployment {
                id: id.clone(),
                tenant: blueprint.tenant.clone(),
                blueprint_id: blueprint_id.clone(),
                inputs,
                topology: blueprint.topology.clone(),
                runtime_only_evaluation: false,
                visibility: Visibility::Tenant,
                created_at: now,
                updated_at: now,
            };
            let topology = deployment.topology.clone();
            state.deployments.insert(id.clone(), deployment.clone());
            state.sync_node_instances(&id, &topology);

            new_execution(
                state,
                &StartExecution::on_deployment(&id, CREATE_ENVIRONMENT_WORKFLOW, Value::Null),
            )?;
            info!("Deployment {id} created from blueprint {blueprint_id}");
            Ok(deployment)
        })
        .await
    }

    async fn delete(&self, deployment_id: &str) -> Result<()> {
        let id = deployment_id.to_string();
        self.mutate(move |state| {
            let deployment = state
                .remove_deployment(&id)
                .ok_or_else(|| not_found("deployment", &id))?;

            let now = Utc::now();
            let execution = Execution {
                id: Uuid::new_v4().to_string(),
                tenant: deployment.tenant,
                deployment_id: Some(id.clone()),
                blueprint_id: Some(deployment.blueprint_id),
                workflow_id: String::from(DELETE_ENVIRONMENT_WORKFLOW),
                status: ExecutionStatus::Terminated,
                parameters: Value::Null,
                error: String::new(),
                token: None,
                created_at: now,
                scheduled_for: None,
                ended_at: Some(now),
            };
            state.executions.insert(execution.id.clone(), execution);
            info!("Deployment {id} deleted");
            Ok(())
        })
        .await
    }

    async fn get(&self, deployment_id: &str) -> Result<Deployment> {
        self.state
            .read()
            .await
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| not_found("deployment", deployment_id))
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        Ok(self.state.read().await.deployments.values().cloned().collect())
    }

    async fn set_topology(&self, deployment_id: &str, topology: Topology) -> Result<()> {
        let id = deployment_id.to_string();
        self.mutate(move |state| {
            let deployment = state
                .deployments
                .get_mut(&id)
                .ok_or_else(|| not_found("deployment", &id))?;
            deployment.topology = topology.clone();
            deployment.updated_at = Utc::now();
            let created = state.sync_node_instances(&id, &topology);
            debug!("Topology of {id} replaced, {} new instance(s)", created.len());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ExecutionsApi for LocalManager {
    async fn start(&self, request: StartExecution) -> Result<Execution> {
        self.mutate(move |state| new_execution(state, &request)).await
    }

    async fn get(&self, execution_id: &str) -> Result<Execution> {
        let current = self
            .state
            .read()
            .await
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| not_found("execution", execution_id))?;

        let Some(next) = next_status(current.status, self.outcome(&current.workflow_id)) else {
            return Ok(current);
        };
        let error = if next == ExecutionStatus::Failed {
            format!("Workflow {} failed", current.workflow_id)
        } else {
            String::new()
        };
        let id = execution_id.to_string();
        self.mutate(move |state| set_execution_status(state, &id, next, error))
            .await
    }

    async fn list(&self, deployment_id: &str) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.deployment_id.as_deref() == Some(deployment_id))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: String,
    ) -> Result<Execution> {
        let id = execution_id.to_string();
        self.mutate(move |state| set_execution_status(state, &id, status, error))
            .await
    }
}

#[async_trait]
impl SecretsApi for LocalManager {
    async fn create(&self, key: &str, value: &str, options: SecretOptions) -> Result<SecretView> {
        let encrypted = self.cipher.encrypt(value)?;
        let key = key.to_string();
        let plain = value.to_string();
        self.mutate(move |state| {
            let now = Utc::now();
            let created_at = match state.secrets.get(&key) {
                Some(_) if !options.update_if_exists => {
                    return Err(ClientError::conflict("secret", &key, "already exists").into());
                }
                Some(existing) => existing.created_at,
                None => now,
            };
            state.secrets.insert(
                key.clone(),
                Secret {
                    key: key.clone(),
                    tenant: String::from(DEFAULT_TENANT),
                    value: encrypted,
                    visibility: options.visibility,
                    is_hidden_value: options.is_hidden_value,
                    created_at,
                    updated_at: now,
                },
            );
            debug!("Secret {key} stored");
            Ok(SecretView {
                key,
                value: plain,
                is_hidden_value: options.is_hidden_value,
                visibility: options.visibility,
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate(move |state| {
            state
                .secrets
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| not_found("secret", &key))
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<SecretView> {
        let secret = self
            .state
            .read()
            .await
            .secrets
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("secret", key))?;
        Ok(SecretView {
            value: self.cipher.decrypt(&secret.value)?,
            key: secret.key,
            is_hidden_value: secret.is_hidden_value,
            visibility: secret.visibility,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.secrets.keys().cloned().collect())
    }
}

#[async_trait]
impl PluginsApi for LocalManager {
    async fn upload(&self, archive: &Path) -> Result<Plugin> {
        let staging = tempfile::tempdir()?;
        let (archive_path, staging_path) = (archive.to_path_buf(), staging.path().to_path_buf());
        let (package, info) = blocking(move || {
            let package = unpack_plugin(&archive_path, &staging_path)?;
            let info = inspect_wagon(&package.wagon)?;
            Ok((package, info))
        })
        .await?;

        let archive_name = package
            .wagon
            .file_name()
            .map_or_else(|| String::from("plugin.wgn"), |n| n.to_string_lossy().into_owned());
        let plugin = Plugin {
            id: Uuid::new_v4().to_string(),
            tenant: String::from(DEFAULT_TENANT),
            package_name: info.package_name,
            package_version: info.package_version,
            archive_name,
            uploaded_at: Utc::now(),
        };

        let duplicate = self.state.read().await.plugins.values().any(|p| {
            p.package_name == plugin.package_name && p.package_version == plugin.package_version
        });
        if duplicate {
            return Err(ClientError::conflict(
                "plugin",
                &plugin.package_name,
                format!("version {} is already installed", plugin.package_version),
            )
            .into());
        }

        self.store_plugin_file(&plugin, &package.wagon).await?;
        let stored = plugin.clone();
        self.mutate(move |state| {
            state.plugins.insert(stored.id.clone(), stored);
            Ok(())
        })
        .await?;
        info!(
            "Plugin {} {} uploaded as {}",
            plugin.package_name, plugin.package_version, plugin.id
        );
        Ok(plugin)
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        let id = plugin_id.to_string();
        self.mutate(move |state| {
            state
                .plugins
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| not_found("plugin", &id))
        })
        .await?;
        if let Err(e) = fs::remove_dir_all(self.plugin_dir(plugin_id)).await {
            debug!("No files removed for plugin {plugin_id}: {e}");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Plugin>> {
        Ok(self.state.read().await.plugins.values().cloned().collect())
    }
}

#[async_trait]
impl MaintenanceApi for LocalManager {
    async fn activate(&self) -> Result<()> {
        self.mutate(|state| {
            state.maintenance = MaintenanceMode::Activated;
            Ok(())
        })
        .await
    }

    async fn deactivate(&self) -> Result<()> {
        self.mutate(|state| {
            state.maintenance = MaintenanceMode::Deactivated;
            Ok(())
        })
        .await
    }

    async fn status(&self) -> Result<MaintenanceMode> {
        Ok(self.state.read().await.maintenance)
    }
}

#[async_trait]
impl SnapshotsApi for LocalManager {
    async fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.state
            .read()
            .await
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| not_found("snapshot", snapshot_id))
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        Ok(self.state.read().await.snapshots.values().cloned().collect())
    }

    async fn create(&self, snapshot_id: &str) -> Result<Snapshot> {
        let state = self.state().await;
        if state.snapshots.contains_key(snapshot_id) {
            return Err(ClientError::conflict("snapshot", snapshot_id, "already exists").into());
        }

        let mut dump = SnapshotDump::new(snapshot_id, ManagerVersion::CURRENT);
        dump.encryption_key = Some(state.encryption_key.clone());
        dump.set_table(restore::TENANTS, &state.tenants)?;
        dump.set_table(restore::BLUEPRINTS, state.blueprints.values())?;
        dump.set_table(restore::DEPLOYMENTS, state.deployments.values())?;
        dump.set_table(restore::NODE_INSTANCES, state.node_instances.values())?;
        dump.set_table(restore::SECRETS, state.secrets.values())?;
        dump.set_table(restore::PLUGINS, state.plugins.values())?;
        dump.set_table(restore::EXECUTIONS, state.executions.values())?;
        dump.set_table(restore::EVENTS, &state.events)?;
        dump.set_table(restore::AGENTS, state.agents.values())?;
        dump.set_table(restore::DEPENDENCIES, state.dependencies.values())?;
        for plugin in state.plugins.values() {
            let path = self.plugin_dir(&plugin.id).join(&plugin.archive_name);
            match fs::read(&path).await {
                Ok(wagon) => {
                    dump.plugin_archives.insert(plugin.id.clone(), wagon);
                }
                Err(e) => warn!("Plugin {} has no wagon at {}: {e}", plugin.id, path.display()),
            }
        }

        let path = self.snapshot_path(snapshot_id);
        blocking(move || dump.write(&path)).await?;

        let snapshot = Snapshot {
            id: snapshot_id.to_string(),
            status: SnapshotStatus::Created,
            created_at: Utc::now(),
            error: String::new(),
        };
        let stored = snapshot.clone();
        self.mutate(move |state| {
            state.snapshots.insert(stored.id.clone(), stored);
            Ok(())
        })
        .await?;
        info!("Snapshot {snapshot_id} created");
        Ok(snapshot)
    }

    async fn upload(&self, snapshot_id: &str, archive: &Path) -> Result<Snapshot> {
        if self.state.read().await.snapshots.contains_key(snapshot_id) {
            return Err(ClientError::conflict("snapshot", snapshot_id, "already exists").into());
        }
        let path = self.snapshot_path(snapshot_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(archive, &path).await?;

        let snapshot = Snapshot {
            id: snapshot_id.to_string(),
            status: SnapshotStatus::Uploaded,
            created_at: Utc::now(),
            error: String::new(),
        };
        let stored = snapshot.clone();
        self.mutate(move |state| {
            state.snapshots.insert(stored.id.clone(), stored);
            Ok(())
        })
        .await?;
        info!("Snapshot {snapshot_id} uploaded");
        Ok(snapshot)
    }

    async fn archive_path(&self, snapshot_id: &str) -> Result<PathBuf> {
        if !self.state.read().await.snapshots.contains_key(snapshot_id) {
            return Err(not_found("snapshot", snapshot_id));
        }
        Ok(self.snapshot_path(snapshot_id))
    }
}

#[async_trait]
impl DeploymentUpdatesApi for LocalManager {
    async fn save(&self, update: &DeploymentUpdate) -> Result<()> {
        let update = update.clone();
        self.mutate(move |state| {
            state.deployment_updates.insert(update.id.clone(), update);
            Ok(())
        })
        .await
    }

    async fn get(&self, update_id: &str) -> Result<DeploymentUpdate> {
        self.state
            .read()
            .await
            .deployment_updates
            .get(update_id)
            .cloned()
            .ok_or_else(|| not_found("deployment update", update_id))
    }

    async fn list(&self, deployment_id: &str) -> Result<Vec<DeploymentUpdate>> {
        let mut updates: Vec<DeploymentUpdate> = self
            .state
            .read()
            .await
            .deployment_updates
            .values()
            .filter(|u| u.deployment_id == deployment_id)
            .cloned()
            .collect();
        updates.sort_by_key(|u| u.created_at);
        Ok(updates)
    }
}

#[async_trait]
impl RuntimeStore for LocalManager {
    async fn node_instances(&self, deployment_id: &str) -> Result<Vec<NodeInstance>> {
        Ok(self
            .state
            .read()
            .await
            .instances_of(deployment_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_runtime_properties(
        &self,
        node_instance_id: &str,
    ) -> Result<BTreeMap<String, Value>> {
        self.state
            .read()
            .await
            .node_instances
            .get(node_instance_id)
            .map(|i| i.runtime_properties.clone())
            .ok_or_else(|| not_found("node instance", node_instance_id))
    }

    async fn set_runtime_properties(
        &self,
        node_instance_id: &str,
        properties: BTreeMap<String, Value>,
    ) -> Result<()> {
        let id = node_instance_id.to_string();
        self.mutate(move |state| {
            let instance = state
                .node_instances
                .get_mut(&id)
                .ok_or_else(|| not_found("node instance", &id))?;
            instance.runtime_properties = properties;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ImportSink for LocalManager {
    async fn import_table(&self, table: TableData) -> Result<usize> {
        self.mutate(move |state| self.import_into(state, table)).await
    }

    async fn install_plugin(&self, mut plugin: Plugin, wagon: &Path) -> Result<()> {
        let wagon_path = wagon.to_path_buf();
        let info = blocking(move || inspect_wagon(&wagon_path)).await?;
        if info.package_name != plugin.package_name {
            warn!(
                "Plugin {} record names {} but its wagon holds {}",
                plugin.id, plugin.package_name, info.package_name
            );
        }
        if plugin.archive_name.is_empty() {
            plugin.archive_name = format!("{}.wgn", plugin.id);
        }

        self.store_plugin_file(&plugin, wagon).await?;
        self.mutate(move |state| {
            state.plugins.insert(plugin.id.clone(), plugin);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventsApi for LocalManager {
    async fn purge(&self, request: PurgeRequest) -> Result<PurgeOutcome> {
        if !request.event_types.iter().any(|t| t == WORKFLOW_EVENT_TYPE) {
            return Err(bad_request(format!(
                "event_types must include {WORKFLOW_EVENT_TYPE}"
            )));
        }

        let matches = |event: &Event| {
            event.deployment_id.as_deref() == Some(request.deployment_id.as_str())
                && match event.kind {
                    EventKind::Event => request.event_types.contains(&event.event_type),
                    EventKind::Log => request.include_logs,
                }
        };

        let (events, logs): (Vec<Event>, Vec<Event>) = self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| matches(*e))
            .cloned()
            .partition(|e| e.kind == EventKind::Event);

        let mut stored_to = Vec::new();
        if let Some(dir) = &request.store_before {
            fs::create_dir_all(dir).await?;
            let stamp = Utc::now().format("%Y%m%dT%H%M%S");
            let mut batches = vec![("events", &events)];
            if request.include_logs {
                batches.push(("logs", &logs));
            }
            for (table, rows) in batches {
                let path = dir.join(format!("{table}_{}_{stamp}.log", request.deployment_id));
                let mut content = String::new();
                for row in rows {
                    let line = serde_json::to_string(row)
                        .map_err(|e| ManagerError::internal(e.to_string()))?;
                    content.push_str(&line);
                    content.push('\n');
                }
                fs::write(&path, content).await?;
                stored_to.push(path);
            }
        }

        let deleted = events.len() + logs.len();
        let deployment_id = request.deployment_id.clone();
        let actor = request.actor.clone();
        self.mutate(move |state| {
            state.events.retain(|e| !matches(e));
            state.add_audit(AuditEntry {
                operation: String::from("Logs deletion"),
                message: format!("Deleted {deleted} entries for deployment id {deployment_id}"),
                actor,
                timestamp: Utc::now(),
            });
            Ok(())
        })
        .await?;

        info!("Purged {deleted} event(s) of {}", request.deployment_id);
        Ok(PurgeOutcome { deleted, stored_to })
    }

    async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.state.read().await.audit_log.clone())
    }
}

#[async_trait]
impl SettingsSource for LocalManager {
    async fn config_entries(&self, scope: &str) -> Result<Vec<ConfigEntry>> {
        let store = self.config_store().await;
        store.config_entries(scope).await
    }
}

impl LocalManager {
    /// Known tenants.
    pub async fn tenants(&self) -> Vec<Tenant> {
        self.state.read().await.tenants.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Node;
    use serde_json::json;

    async fn manager() -> (LocalManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalManager::open(dir.path()).await.unwrap();
        (manager, dir)
    }

    fn topology() -> Topology {
        let mut topology = Topology::default();
        topology
            .nodes
            .insert(String::from("vm"), Node::new("stratus.nodes.Compute"));
        topology
    }

    async fn deploy(manager: &LocalManager, id: &str) -> Deployment {
        BlueprintsApi::upload(manager, "bp", topology()).await.ok();
        DeploymentsApi::create(manager, id, "bp", json!({}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_deployment_create_starts_environment() {
        let (manager, _dir) = manager().await;
        deploy(&manager, "dep").await;

        let executions = ExecutionsApi::list(&manager, "dep").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].workflow_id, CREATE_ENVIRONMENT_WORKFLOW);
        assert_eq!(RuntimeStore::node_instances(&manager, "dep").await.unwrap().len(), 1);

        let err = DeploymentsApi::create(&manager, "dep", "bp", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_executions_advance_on_get() {
        let (manager, _dir) = manager().await;
        deploy(&manager, "dep").await;
        let id = ExecutionsApi::list(&manager, "dep").await.unwrap()[0].id.clone();

        let status = |e: Execution| e.status;
        assert_eq!(status(ExecutionsApi::get(&manager, &id).await.unwrap()), ExecutionStatus::Started);
        assert_eq!(status(ExecutionsApi::get(&manager, &id).await.unwrap()), ExecutionStatus::Terminated);
        assert_eq!(status(ExecutionsApi::get(&manager, &id).await.unwrap()), ExecutionStatus::Terminated);

        manager.set_outcome("install", SimulatedOutcome::Fail);
        let failing = ExecutionsApi::start(
            &manager,
            StartExecution::on_deployment("dep", "install", json!({})),
        )
        .await
        .unwrap();
        ExecutionsApi::get(&manager, &failing.id).await.unwrap();
        let failed = ExecutionsApi::get(&manager, &failing.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(!failed.error.is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_blocks_executions() {
        let (manager, _dir) = manager().await;
        deploy(&manager, "dep").await;
        MaintenanceApi::activate(&manager).await.unwrap();

        let request = StartExecution::on_deployment("dep", "install", json!({}));
        assert!(ExecutionsApi::start(&manager, request.clone()).await.is_err());

        let bypass = StartExecution {
            bypass_maintenance: true,
            ..request
        };
        assert!(ExecutionsApi::start(&manager, bypass).await.is_ok());
    }

    #[tokio::test]
    async fn test_secrets_encrypted_at_rest() {
        let (manager, dir) = manager().await;
        SecretsApi::create(&manager, "db", "hunter2", SecretOptions::default())
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("state/state.json")).unwrap();
        assert!(!on_disk.contains("hunter2"));
        assert_eq!(SecretsApi::get(&manager, "db").await.unwrap().value, "hunter2");

        let err = SecretsApi::create(&manager, "db", "other", SecretOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        let options = SecretOptions {
            update_if_exists: true,
            ..SecretOptions::default()
        };
        SecretsApi::create(&manager, "db", "other", options).await.unwrap();
        assert_eq!(SecretsApi::get(&manager, "db").await.unwrap().value, "other");
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = LocalManager::open(dir.path()).await.unwrap();
            SecretsApi::create(&manager, "db", "hunter2", SecretOptions::default())
                .await
                .unwrap();
        }
        let manager = LocalManager::open(dir.path()).await.unwrap();
        assert_eq!(SecretsApi::get(&manager, "db").await.unwrap().value, "hunter2");
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_untouched() {
        let (manager, _dir) = manager().await;
        let before = manager.state().await.deployments.len();
        assert!(DeploymentsApi::create(&manager, "dep", "missing", json!({})).await.is_err());
        assert_eq!(manager.state().await.deployments.len(), before);
    }

    #[tokio::test]
    async fn test_purge_events_with_audit() {
        let (manager, dir) = manager().await;
        deploy(&manager, "dep").await;
        let id = ExecutionsApi::list(&manager, "dep").await.unwrap()[0].id.clone();
        ExecutionsApi::get(&manager, &id).await.unwrap();
        ExecutionsApi::get(&manager, &id).await.unwrap();

        let missing_type = PurgeRequest {
            deployment_id: String::from("dep"),
            event_types: vec![String::from("other")],
            include_logs: false,
            store_before: None,
            actor: String::from("admin"),
        };
        assert!(EventsApi::purge(&manager, missing_type).await.is_err());

        let request = PurgeRequest {
            deployment_id: String::from("dep"),
            event_types: vec![String::from(WORKFLOW_EVENT_TYPE)],
            include_logs: true,
            store_before: Some(dir.path().join("dumps")),
            actor: String::from("admin"),
        };
        let outcome = EventsApi::purge(&manager, request).await.unwrap();
        assert_eq!(outcome.deleted, 4);
        assert_eq!(outcome.stored_to.len(), 2);
        let stored = std::fs::read_to_string(&outcome.stored_to[0]).unwrap();
        assert_eq!(stored.lines().count(), 2);

        let audit = EventsApi::audit_log(&manager).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].operation, "Logs deletion");
        assert_eq!(audit[0].message, "Deleted 4 entries for deployment id dep");
        assert!(manager.state().await.events.is_empty());
    }

    #[tokio::test]
    async fn test_import_skips_known_events() {
        let (manager, _dir) = manager().await;
        let event = |id: &str| Event {
            id: id.to_string(),
            kind: EventKind::Event,
            deployment_id: Some(String::from("dep")),
            execution_id: None,
            event_type: String::from(WORKFLOW_EVENT_TYPE),
            message: String::from("started"),
            timestamp: Utc::now(),
        };

        let first = TableData::Events(vec![event("e1"), event("e2")]);
        assert_eq!(ImportSink::import_table(&manager, first).await.unwrap(), 2);

        let second = TableData::Events(vec![event("e2"), event("e3"), event("e3")]);
        assert_eq!(ImportSink::import_table(&manager, second).await.unwrap(), 1);
        assert_eq!(manager.state().await.events.len(), 3);
    }

    #[tokio::test]
    async fn test_config_entries_seeded() {
        let (manager, _dir) = manager().await;
        let entries = manager.config_entries(REST_SCOPE).await.unwrap();
        assert!(entries.iter().any(|e| e.name == "rest_service_log_level"));
    }
}
