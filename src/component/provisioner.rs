//! Component provisioner.
//!
//! Creates and deletes a nested deployment together with the secrets and
//! plugins it declares. Everything provisioned is recorded on the owning
//! node instance so deletion can reverse it without looking at the
//! blueprint again.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::archive;
use super::fetch::ArtifactFetcher;
use super::record::{ComponentRecord, DeploymentRef};
use super::spec::{ComponentSpec, PluginSource};
use crate::error::{ComponentError, ManagerError, Result};
use crate::execution::ExecutionPoller;
use crate::manager::{CREATE_ENVIRONMENT_WORKFLOW, ManagerClients, SecretOptions};

const DELETE_OPERATION: &str = "delete_deployment";

fn action_failed(action: &'static str, deployment_id: &str, cause: &ManagerError) -> ManagerError {
    ComponentError::ActionFailed {
        action,
        deployment_id: deployment_id.to_string(),
        reason: cause.to_string(),
    }
    .into()
}

/// Provisions components through the manager collaborators.
#[derive(Clone)]
pub struct ComponentProvisioner {
    clients: ManagerClients,
    fetcher: Arc<dyn ArtifactFetcher>,
    poller: ExecutionPoller,
}

impl std::fmt::Debug for ComponentProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProvisioner")
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl ComponentProvisioner {
    /// Creates a provisioner.
    #[must_use]
    pub fn new(
        clients: ManagerClients,
        fetcher: Arc<dyn ArtifactFetcher>,
        poller: ExecutionPoller,
    ) -> Self {
        Self {
            clients,
            fetcher,
            poller,
        }
    }

    /// Creates the component declared by `spec` on behalf of `owner`.
    ///
    /// Returns `false` without side effects if the nested deployment
    /// already exists. Secrets are only created once the environment
    /// creation execution succeeded.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed plugins, `ActionFailed`
    /// for collaborator failures, `ExecutionNotFound` if the deployment has
    /// no environment creation execution, and `Timeout` if it does not
    /// finish in time.
    pub async fn create(
        &self,
        owner: &str,
        spec: &ComponentSpec,
        timeout: Duration,
    ) -> Result<bool> {
        let deployment_id = spec.deployment.id.as_str();

        match self.clients.deployments.get(deployment_id).await {
            Ok(_) => {
                info!("Component deployment '{deployment_id}' already exists, nothing to create");
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(action_failed("create", deployment_id, &e)),
        }

        let mut record = self.load_record(owner).await?;

        // Uploaded plugins are recorded before anything else can fail.
        let before = record.plugins.len();
        let uploaded = self.upload_plugins_into(&spec.plugins, &mut record.plugins).await;
        if uploaded.is_err() || record.plugins.len() != before {
            self.save_record(owner, &record).await?;
        }
        uploaded?;

        info!(
            "Creating component deployment '{deployment_id}' from blueprint '{}'",
            spec.deployment.blueprint_id
        );
        self.clients
            .deployments
            .create(
                deployment_id,
                &spec.deployment.blueprint_id,
                spec.deployment.inputs.clone(),
            )
            .await
            .map_err(|e| action_failed("create", deployment_id, &e))?;
        record.deployment = Some(DeploymentRef {
            id: deployment_id.to_string(),
            blueprint_id: spec.deployment.blueprint_id.clone(),
        });
        self.save_record(owner, &record).await?;

        self.wait_for_environment(deployment_id, timeout).await?;

        let mut failure = None;
        for (key, value) in &spec.secrets {
            debug!("Creating secret '{key}' for component '{deployment_id}'");
            match self
                .clients
                .secrets
                .create(key, value, SecretOptions::default())
                .await
            {
                Ok(_) => {
                    record.secrets.insert(key.clone());
                }
                Err(e) => {
                    failure = Some(action_failed("create", deployment_id, &e));
                    break;
                }
            }
        }
        if !spec.secrets.is_empty() {
            self.save_record(owner, &record).await?;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        info!("Component deployment '{deployment_id}' created");
        Ok(true)
    }

    /// Deletes the component recorded on `owner`.
    ///
    /// Returns `true` if the nested deployment is gone, including when it
    /// never existed. Recorded plugins and secrets are deleted before the
    /// deployment; the record is then cleared.
    ///
    /// # Errors
    ///
    /// Returns `ActionFailed` for collaborator failures and `Timeout` if
    /// the deployment does not disappear in time.
    pub async fn delete(
        &self,
        owner: &str,
        deployment_id: &str,
        timeout: Duration,
    ) -> Result<bool> {
        match self.clients.deployments.get(deployment_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!("Component deployment '{deployment_id}' not found, nothing to delete");
                self.clear_record(owner).await?;
                return Ok(true);
            }
            Err(e) => return Err(action_failed("delete", deployment_id, &e)),
        }

        let record = self.load_record(owner).await?;

        for plugin_id in &record.plugins {
            debug!("Deleting plugin '{plugin_id}' of component '{deployment_id}'");
            match self.clients.plugins.delete(plugin_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("Plugin '{plugin_id}' already deleted"),
                Err(e) => return Err(action_failed("delete", deployment_id, &e)),
            }
        }

        for key in &record.secrets {
            debug!("Deleting secret '{key}' of component '{deployment_id}'");
            match self.clients.secrets.delete(key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("Secret '{key}' already deleted"),
                Err(e) => return Err(action_failed("delete", deployment_id, &e)),
            }
        }

        info!("Deleting component deployment '{deployment_id}'");
        self.clients
            .deployments
            .delete(deployment_id)
            .await
            .map_err(|e| action_failed("delete", deployment_id, &e))?;

        let deployments = &self.clients.deployments;
        let gone = self
            .poller
            .poll_with_timeout(
                move || async move {
                    match deployments.get(deployment_id).await {
                        Ok(_) => Ok(false),
                        Err(e) if e.is_not_found() => Ok(true),
                        Err(e) => Err(e),
                    }
                },
                timeout,
            )
            .await
            .map_err(|e| action_failed("delete", deployment_id, &e))?;
        if !gone {
            return Err(ComponentError::Timeout {
                operation: DELETE_OPERATION.to_string(),
                deployment_id: deployment_id.to_string(),
                timeout,
            }
            .into());
        }

        self.clear_record(owner).await?;
        info!("Component deployment '{deployment_id}' deleted");
        Ok(true)
    }

    /// Uploads every plugin of a `plugins` property value.
    ///
    /// Returns the assigned plugin ids. An empty map is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed map, `ArtifactFailed` if
    /// an artifact cannot be fetched or packed, and `ActionFailed` if the
    /// upload fails.
    pub async fn upload_plugins(&self, plugins: &serde_json::Value) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.upload_plugins_into(plugins, &mut ids).await?;
        Ok(ids)
    }

    async fn upload_plugins_into(
        &self,
        plugins: &serde_json::Value,
        ids: &mut Vec<String>,
    ) -> Result<()> {
        let sources = PluginSource::parse_map(plugins)?;
        for (name, source) in &sources {
            let id = self.upload_plugin(name, source).await?;
            info!("Uploaded plugin '{name}' as '{id}'");
            ids.push(id);
        }
        Ok(())
    }

    async fn upload_plugin(&self, name: &str, source: &PluginSource) -> Result<String> {
        let artifact_error = |e: &ManagerError| ComponentError::ArtifactFailed {
            name: name.to_string(),
            reason: e.to_string(),
        };

        // Dropping the directory removes every temporary artifact.
        let workdir = tempfile::tempdir()?;
        let wagon = workdir.path().join(format!("{name}.wgn"));
        let plugin_yaml = workdir.path().join(archive::PLUGIN_YAML_NAME);
        let bundle = workdir.path().join(format!("{name}.tar"));

        self.fetcher
            .fetch(&source.wagon_path, &wagon)
            .await
            .map_err(|e| artifact_error(&e))?;
        self.fetcher
            .fetch(&source.plugin_yaml_path, &plugin_yaml)
            .await
            .map_err(|e| artifact_error(&e))?;

        let packed: PathBuf = bundle.clone();
        tokio::task::spawn_blocking(move || archive::pack_plugin(&wagon, &plugin_yaml, &packed))
            .await
            .map_err(|e| ManagerError::internal(format!("archive task failed: {e}")))?
            .map_err(|e| artifact_error(&e))?;

        let plugin = self
            .clients
            .plugins
            .upload(&bundle)
            .await
            .map_err(|e| ComponentError::ArtifactFailed {
                name: name.to_string(),
                reason: format!("upload failed: {e}"),
            })?;
        Ok(plugin.id)
    }

    async fn wait_for_environment(&self, deployment_id: &str, timeout: Duration) -> Result<()> {
        let executions = self
            .clients
            .executions
            .list(deployment_id)
            .await
            .map_err(|e| action_failed("create", deployment_id, &e))?;
        let execution = executions
            .into_iter()
            .find(|e| e.workflow_id == CREATE_ENVIRONMENT_WORKFLOW)
            .ok_or_else(|| ComponentError::ExecutionNotFound {
                deployment_id: deployment_id.to_string(),
            })?;

        debug!(
            "Waiting for execution {} of component '{deployment_id}'",
            execution.id
        );
        let finished = self
            .poller
            .wait_for_execution(self.clients.executions.as_ref(), &execution.id, timeout)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ComponentError::ExecutionNotFound {
                        deployment_id: deployment_id.to_string(),
                    }
                    .into()
                } else {
                    action_failed("create", deployment_id, &e)
                }
            })?;

        match finished {
            None => Err(ComponentError::Timeout {
                operation: CREATE_ENVIRONMENT_WORKFLOW.to_string(),
                deployment_id: deployment_id.to_string(),
                timeout,
            }
            .into()),
            Some(done) if !done.status.is_success() => Err(ComponentError::ExecutionFailed {
                deployment_id: deployment_id.to_string(),
                execution_id: done.id,
                status: done.status.to_string(),
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    async fn load_record(&self, owner: &str) -> Result<ComponentRecord> {
        let properties = self.clients.runtime.get_runtime_properties(owner).await?;
        ComponentRecord::from_runtime_properties(&properties)
    }

    async fn save_record(&self, owner: &str, record: &ComponentRecord) -> Result<()> {
        let mut properties = self.clients.runtime.get_runtime_properties(owner).await?;
        record.store_into(&mut properties);
        self.clients
            .runtime
            .set_runtime_properties(owner, properties)
            .await
    }

    async fn clear_record(&self, owner: &str) -> Result<()> {
        self.clients
            .runtime
            .set_runtime_properties(owner, BTreeMap::new())
            .await
    }
}
