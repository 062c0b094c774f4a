//! Deployment update state machine.
//!
//! Drives one update from `updating` to a terminal state:
//!
//! 1. Diff the deployment's topology against the target blueprint and
//!    persist the steps.
//! 2. Dispatch the update workflow and wait for it.
//! 3. Finalize: tear down components of removed nodes, persist the new
//!    topology, then create components of added nodes.
//!
//! Any failure moves the update to `failed` and is returned to the caller.
//! Once dispatched, the workflow is never cancelled.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::apply::apply_steps;
use super::diff::DiffEngine;
use super::state::{DeploymentUpdate, UpdateState};
use super::step::{ActionType, EntityChange, EntityPath, EntityType};
use crate::component::{ArtifactFetcher, ComponentProvisioner, ComponentRecord, ComponentSpec};
use crate::config::ConfigContext;
use crate::error::{ManagerError, Result, UpdateError};
use crate::execution::ExecutionPoller;
use crate::manager::{ManagerClients, StartExecution};
use crate::topology::{Topology, TopologyHasher};

/// Node type provisioned as a component.
pub const COMPONENT_NODE_TYPE: &str = "stratus.nodes.Component";

/// Runs deployment updates.
#[derive(Clone)]
pub struct UpdateStateMachine {
    clients: ManagerClients,
    provisioner: ComponentProvisioner,
    poller: ExecutionPoller,
    workflow_id: String,
    component_timeout: Duration,
}

impl std::fmt::Debug for UpdateStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStateMachine")
            .field("poller", &self.poller)
            .field("workflow_id", &self.workflow_id)
            .field("component_timeout", &self.component_timeout)
            .finish_non_exhaustive()
    }
}

impl UpdateStateMachine {
    /// Creates a state machine using the configured workflow, poll interval
    /// and component timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read.
    pub fn new(
        clients: ManagerClients,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: &ConfigContext,
    ) -> Result<Self> {
        let current = config.current();
        let poller = ExecutionPoller::new(current.poll_interval()?);
        let provisioner = ComponentProvisioner::new(clients.clone(), fetcher, poller);
        Ok(Self {
            clients,
            provisioner,
            poller,
            workflow_id: current.update_workflow()?,
            component_timeout: current.component_timeout()?,
        })
    }

    /// Updates `deployment_id` to the topology of `blueprint_id`.
    ///
    /// `timeout` bounds the wait for the update workflow. Returns the
    /// update in its `successful` state.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the topologies cannot be diffed,
    /// `ExecutionNotFound`, `Timeout` or `ExecutionFailed` if the workflow
    /// does not succeed in time, and `FinalizeFailed` if a finalize step
    /// fails. The persisted update is `failed` in every case where it was
    /// created.
    pub async fn run(
        &self,
        deployment_id: &str,
        blueprint_id: &str,
        timeout: Duration,
    ) -> Result<DeploymentUpdate> {
        let deployment = self.clients.deployments.get(deployment_id).await?;
        let blueprint = self.clients.blueprints.get(blueprint_id).await?;

        let mut update = DeploymentUpdate::new(deployment_id, blueprint_id, &self.workflow_id);
        info!(
            "Starting update {} of deployment '{deployment_id}' to blueprint '{blueprint_id}'",
            update.id
        );

        match self
            .drive(&mut update, &deployment.topology, &blueprint.topology, timeout)
            .await
        {
            Ok(()) => {
                info!("Update {} of deployment '{deployment_id}' successful", update.id);
                Ok(update)
            }
            Err(e) => {
                error!("Update {} of deployment '{deployment_id}' failed: {e}", update.id);
                if update.fail(e.to_string()).is_ok() {
                    if let Err(save) = self.clients.updates.save(&update).await {
                        warn!("Failed to persist failed update {}: {save}", update.id);
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        update: &mut DeploymentUpdate,
        old: &Topology,
        new: &Topology,
        timeout: Duration,
    ) -> Result<()> {
        let hasher = TopologyHasher::new();
        update.old_fingerprint = hasher.fingerprint(old);
        update.new_fingerprint = hasher.fingerprint(new);

        let diff = DiffEngine::new().diff(old, new)?;
        debug!(
            "Update {}: {} step(s), {} node(s) touched",
            update.id,
            diff.steps.len(),
            diff.modified_nodes.len()
        );
        update.steps = diff.steps;
        update.modified_nodes = diff.modified_nodes;
        let target = apply_steps(old, &update.steps)?;
        self.clients.updates.save(update).await?;

        update.transition(UpdateState::ExecutingWorkflow)?;
        self.execute_workflow(update, timeout).await?;

        update.transition(UpdateState::Finalizing)?;
        self.clients.updates.save(update).await?;
        self.finalize(update, old, &target).await?;

        update.transition(UpdateState::Successful)?;
        self.clients.updates.save(update).await
    }

    async fn execute_workflow(
        &self,
        update: &mut DeploymentUpdate,
        timeout: Duration,
    ) -> Result<()> {
        let execution = self
            .clients
            .executions
            .start(StartExecution::on_deployment(
                &update.deployment_id,
                &update.workflow_id,
                json!({"update_id": update.id}),
            ))
            .await?;
        update.execution_id = Some(execution.id.clone());
        self.clients.updates.save(update).await?;

        debug!("Update {}: waiting for execution {}", update.id, execution.id);
        let finished = self
            .poller
            .wait_for_execution(self.clients.executions.as_ref(), &execution.id, timeout)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ManagerError::from(UpdateError::ExecutionNotFound {
                        update_id: update.id.clone(),
                        deployment_id: update.deployment_id.clone(),
                        execution_id: execution.id.clone(),
                    })
                } else {
                    e
                }
            })?;

        match finished {
            None => Err(UpdateError::Timeout {
                update_id: update.id.clone(),
                deployment_id: update.deployment_id.clone(),
                execution_id: execution.id,
                timeout,
            }
            .into()),
            Some(done) if !done.status.is_success() => Err(UpdateError::ExecutionFailed {
                update_id: update.id.clone(),
                deployment_id: update.deployment_id.clone(),
                execution_id: done.id,
                status: done.status.to_string(),
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    /// Applies side effects in step order.
    ///
    /// Removals precede additions in step order, so components of removed
    /// nodes are deleted while their instances still exist, and components
    /// of added nodes are created once their instances do.
    async fn finalize(
        &self,
        update: &DeploymentUpdate,
        old: &Topology,
        target: &Topology,
    ) -> Result<()> {
        let (removals, rest): (Vec<&EntityChange>, Vec<&EntityChange>) = update
            .steps
            .iter()
            .partition(|s| s.action == ActionType::Remove);

        for step in removals {
            self.finalize_step(update, step, old, false).await?;
        }

        self.clients
            .deployments
            .set_topology(&update.deployment_id, target.clone())
            .await
            .map_err(|e| finalize_failed(update, "topology", &e))?;

        for step in rest {
            self.finalize_step(update, step, target, true).await?;
        }
        Ok(())
    }

    async fn finalize_step(
        &self,
        update: &DeploymentUpdate,
        step: &EntityChange,
        topology: &Topology,
        create: bool,
    ) -> Result<()> {
        if step.entity_type != EntityType::Node || step.action == ActionType::Modify {
            return Ok(());
        }
        let Some(EntityPath::Node(node_id)) = step.path() else {
            return Ok(());
        };
        let Some(node) = topology.nodes.get(node_id) else {
            return Ok(());
        };
        if node.node_type != COMPONENT_NODE_TYPE {
            return Ok(());
        }

        let instances = self
            .clients
            .runtime
            .node_instances(&update.deployment_id)
            .await
            .map_err(|e| finalize_failed(update, &step.entity_id, &e))?;

        for instance in instances.iter().filter(|i| i.node_id == node_id) {
            let outcome = if create {
                self.create_component(instance.id.as_str(), &node.properties)
                    .await
            } else {
                self.delete_component(instance.id.as_str()).await
            };
            outcome.map_err(|e| finalize_failed(update, &step.entity_id, &e))?;
        }
        Ok(())
    }

    async fn create_component(
        &self,
        owner: &str,
        properties: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let spec = ComponentSpec::from_properties(properties, owner)?;
        let timeout = spec.timeout.unwrap_or(self.component_timeout);
        self.provisioner.create(owner, &spec, timeout).await.map(drop)
    }

    async fn delete_component(&self, owner: &str) -> Result<()> {
        let properties = self.clients.runtime.get_runtime_properties(owner).await?;
        let record = ComponentRecord::from_runtime_properties(&properties)?;
        let Some(deployment) = record.deployment else {
            debug!("Instance {owner} owns no component deployment");
            return Ok(());
        };
        self.provisioner
            .delete(owner, &deployment.id, self.component_timeout)
            .await
            .map(drop)
    }
}

fn finalize_failed(
    update: &DeploymentUpdate,
    entity_id: &str,
    cause: &ManagerError,
) -> ManagerError {
    UpdateError::FinalizeFailed {
        update_id: update.id.clone(),
        deployment_id: update.deployment_id.clone(),
        entity_id: entity_id.to_string(),
        reason: cause.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::MockArtifactFetcher;
    use crate::config::ManagerConfig;
    use crate::error::{ClientError, ErrorKind};
    use crate::execution::ExecutionStatus;
    use crate::manager::{
        Blueprint, Deployment, Execution, MockBlueprintsApi, MockDeploymentUpdatesApi,
        MockDeploymentsApi, MockEventsApi, MockExecutionsApi, MockImportSink,
        MockMaintenanceApi, MockPluginsApi, MockRuntimeStore, MockSecretsApi, MockSnapshotsApi,
        NodeInstance,
    };
    use crate::topology::Node;
    use crate::update::UpdatePhase;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Mocks {
        blueprints: MockBlueprintsApi,
        deployments: MockDeploymentsApi,
        executions: MockExecutionsApi,
        updates: MockDeploymentUpdatesApi,
        runtime: MockRuntimeStore,
    }

    impl Mocks {
        fn new(old: Topology, new: Topology) -> Self {
            let mut blueprints = MockBlueprintsApi::new();
            blueprints.expect_get().returning(move |id| {
                Ok(Blueprint {
                    id: id.to_string(),
                    tenant: String::from("default_tenant"),
                    topology: new.clone(),
                    imported_blueprints: Vec::new(),
                    created_at: Utc::now(),
                })
            });
            let mut deployments = MockDeploymentsApi::new();
            deployments
                .expect_get()
                .withf(|id| id == "dep")
                .returning(move |id| {
                    Ok(Deployment {
                        id: id.to_string(),
                        tenant: String::from("default_tenant"),
                        blueprint_id: String::from("bp-v1"),
                        inputs: json!({}),
                        topology: old.clone(),
                        runtime_only_evaluation: false,
                        visibility: crate::manager::Visibility::Tenant,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    })
                });
            Self {
                blueprints,
                deployments,
                executions: MockExecutionsApi::new(),
                updates: MockDeploymentUpdatesApi::new(),
                runtime: MockRuntimeStore::new(),
            }
        }

        fn machine(self) -> UpdateStateMachine {
            let clients = ManagerClients {
                blueprints: Arc::new(self.blueprints),
                deployments: Arc::new(self.deployments),
                executions: Arc::new(self.executions),
                secrets: Arc::new(MockSecretsApi::new()),
                plugins: Arc::new(MockPluginsApi::new()),
                maintenance: Arc::new(MockMaintenanceApi::new()),
                snapshots: Arc::new(MockSnapshotsApi::new()),
                updates: Arc::new(self.updates),
                runtime: Arc::new(self.runtime),
                import: Arc::new(MockImportSink::new()),
                events: Arc::new(MockEventsApi::new()),
            };
            let config = ConfigContext::new(ManagerConfig::new());
            UpdateStateMachine::new(clients, Arc::new(MockArtifactFetcher::new()), &config).unwrap()
        }
    }

    fn execution(id: &str, status: ExecutionStatus) -> Execution {
        Execution {
            id: id.to_string(),
            tenant: String::from("default_tenant"),
            deployment_id: Some(String::from("dep")),
            blueprint_id: None,
            workflow_id: String::from("update"),
            status,
            parameters: json!({}),
            error: String::new(),
            token: None,
            created_at: Utc::now(),
            scheduled_for: None,
            ended_at: None,
        }
    }

    fn topology(nodes: &[(&str, &str)]) -> Topology {
        let mut topology = Topology::default();
        for (id, node_type) in nodes {
            topology.nodes.insert((*id).to_string(), Node::new(*node_type));
        }
        topology
    }

    /// Records every saved update state.
    fn record_saves(updates: &mut MockDeploymentUpdatesApi) -> Arc<Mutex<Vec<UpdateState>>> {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&saved);
        updates.expect_save().returning(move |update| {
            sink.lock().unwrap().push(update.state);
            Ok(())
        });
        saved
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_update() {
        let old = topology(&[("web", "stratus.nodes.Compute")]);
        let new = topology(&[("web", "stratus.nodes.Compute"), ("db", "stratus.nodes.Compute")]);
        let mut mocks = Mocks::new(old, new.clone());

        mocks
            .executions
            .expect_start()
            .withf(|req| req.workflow_id == "update" && req.deployment_id.as_deref() == Some("dep"))
            .times(1)
            .returning(|_| Ok(execution("exec-1", ExecutionStatus::Pending)));
        mocks
            .executions
            .expect_get()
            .returning(|id| Ok(execution(id, ExecutionStatus::Terminated)));
        mocks
            .deployments
            .expect_set_topology()
            .withf(move |id, topology| id == "dep" && *topology == new)
            .times(1)
            .returning(|_, _| Ok(()));
        mocks.runtime.expect_node_instances().never();
        let saved = record_saves(&mut mocks.updates);

        let update = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(update.state, UpdateState::Successful);
        assert_eq!(update.phase, UpdatePhase::Final);
        assert_eq!(update.execution_id.as_deref(), Some("exec-1"));
        assert!(!update.steps.is_empty());
        assert_ne!(update.old_fingerprint, update.new_fingerprint);

        let saved = saved.lock().unwrap().clone();
        assert_eq!(saved.first(), Some(&UpdateState::Updating));
        assert!(saved.contains(&UpdateState::Finalizing));
        assert_eq!(saved.last(), Some(&UpdateState::Successful));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_workflow_fails_update() {
        let old = topology(&[("web", "stratus.nodes.Compute")]);
        let new = topology(&[]);
        let mut mocks = Mocks::new(old, new);

        mocks
            .executions
            .expect_start()
            .returning(|_| Ok(execution("exec-1", ExecutionStatus::Started)));
        mocks
            .executions
            .expect_get()
            .returning(|id| Ok(execution(id, ExecutionStatus::Failed)));
        mocks.deployments.expect_set_topology().never();
        let saved = record_saves(&mut mocks.updates);

        let err = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Update(UpdateError::ExecutionFailed { .. })));
        assert!(err.to_string().contains("dep"));
        assert_eq!(saved.lock().unwrap().last(), Some(&UpdateState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_execution_fails_update() {
        let mut mocks = Mocks::new(topology(&[("a", "t")]), topology(&[("b", "t")]));
        mocks
            .executions
            .expect_start()
            .returning(|_| Ok(execution("exec-9", ExecutionStatus::Pending)));
        mocks
            .executions
            .expect_get()
            .returning(|id| Err(ClientError::not_found("execution", id).into()));
        mocks.deployments.expect_set_topology().never();
        let saved = record_saves(&mut mocks.updates);

        let err = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("exec-9"));
        assert_eq!(saved.lock().unwrap().last(), Some(&UpdateState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_update() {
        let mut mocks = Mocks::new(topology(&[("a", "t")]), topology(&[("b", "t")]));
        mocks
            .executions
            .expect_start()
            .returning(|_| Ok(execution("exec-2", ExecutionStatus::Pending)));
        mocks
            .executions
            .expect_get()
            .returning(|id| Ok(execution(id, ExecutionStatus::Started)));
        let saved = record_saves(&mut mocks.updates);

        let err = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("Execution timed out"));
        assert_eq!(saved.lock().unwrap().last(), Some(&UpdateState::Failed));
    }

    #[tokio::test]
    async fn test_malformed_topology_never_dispatches() {
        let mut broken = topology(&[("web", "t")]);
        broken.nodes.get_mut("web").unwrap().node_type = String::new();
        let mut mocks = Mocks::new(topology(&[("web", "t")]), broken);
        mocks.executions.expect_start().never();
        let saved = record_saves(&mut mocks.updates);

        let err = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(*saved.lock().unwrap(), vec![UpdateState::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_component_is_deleted_before_topology_change() {
        let old = topology(&[("web", "t"), ("child", COMPONENT_NODE_TYPE)]);
        let new = topology(&[("web", "t")]);
        let mut mocks = Mocks::new(old, new);

        mocks
            .executions
            .expect_start()
            .returning(|_| Ok(execution("exec-1", ExecutionStatus::Pending)));
        mocks
            .executions
            .expect_get()
            .returning(|id| Ok(execution(id, ExecutionStatus::Terminated)));
        mocks.runtime.expect_node_instances().returning(|_| {
            Ok(vec![NodeInstance {
                id: String::from("child_1"),
                deployment_id: String::from("dep"),
                node_id: String::from("child"),
                index: 1,
                state: String::from("started"),
                runtime_properties: BTreeMap::new(),
            }])
        });
        mocks.runtime.expect_get_runtime_properties().returning(|_| {
            let mut props = BTreeMap::new();
            props.insert(String::from("deployment"), json!({"id": "nested"}));
            Ok(props)
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let deleted = Arc::clone(&order);
        let mut nested_gone = false;
        mocks
            .deployments
            .expect_get()
            .withf(|id| id == "nested")
            .returning(move |id| {
                if nested_gone {
                    return Err(ClientError::not_found("deployment", id).into());
                }
                nested_gone = true;
                Ok(Deployment {
                    id: id.to_string(),
                    tenant: String::from("default_tenant"),
                    blueprint_id: String::from("bp-v1"),
                    inputs: json!({}),
                    topology: Topology::default(),
                    runtime_only_evaluation: false,
                    visibility: crate::manager::Visibility::Tenant,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
            });
        mocks.deployments.expect_delete().times(1).returning(move |id| {
            deleted.lock().unwrap().push(format!("delete {id}"));
            Ok(())
        });
        let changed = Arc::clone(&order);
        mocks
            .deployments
            .expect_set_topology()
            .times(1)
            .returning(move |_, _| {
                changed.lock().unwrap().push(String::from("set_topology"));
                Ok(())
            });
        mocks
            .runtime
            .expect_set_runtime_properties()
            .withf(|owner, props| owner == "child_1" && props.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        record_saves(&mut mocks.updates);

        let update = mocks
            .machine()
            .run("dep", "bp-v2", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(update.state, UpdateState::Successful);
        assert_eq!(
            *order.lock().unwrap(),
            vec![String::from("delete nested"), String::from("set_topology")]
        );
    }
}
