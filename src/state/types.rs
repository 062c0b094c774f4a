//! Persisted state of a manager.
//!
//! One document holds every table the local manager serves. Maps are keyed
//! by record id and ordered, so the file diffs cleanly between saves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::manager::{
    Agent, AuditEntry, Blueprint, Deployment, Event, Execution, InterDeploymentDependency,
    MaintenanceMode, NodeInstance, Plugin, Secret, Snapshot, Tenant,
};
use crate::topology::Topology;
use crate::update::DeploymentUpdate;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of audit entries kept.
const MAX_AUDIT_ENTRIES: usize = 1000;

/// Everything a manager knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerState {
    /// State format version.
    pub version: String,
    /// Identity used to encrypt secret values.
    pub encryption_key: String,
    /// Tenants.
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    /// Blueprints by id.
    #[serde(default)]
    pub blueprints: BTreeMap<String, Blueprint>,
    /// Deployments by id.
    #[serde(default)]
    pub deployments: BTreeMap<String, Deployment>,
    /// Node instances by id.
    #[serde(default)]
    pub node_instances: BTreeMap<String, NodeInstance>,
    /// Executions by id.
    #[serde(default)]
    pub executions: BTreeMap<String, Execution>,
    /// Events and logs, oldest first.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Audit log, oldest first.
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
    /// Secrets by key.
    #[serde(default)]
    pub secrets: BTreeMap<String, Secret>,
    /// Plugins by id.
    #[serde(default)]
    pub plugins: BTreeMap<String, Plugin>,
    /// Agents by id.
    #[serde(default)]
    pub agents: BTreeMap<String, Agent>,
    /// Inter-deployment dependencies by id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, InterDeploymentDependency>,
    /// Snapshots by id.
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
    /// Deployment updates by id.
    #[serde(default)]
    pub deployment_updates: BTreeMap<String, DeploymentUpdate>,
    /// Persisted config entries.
    #[serde(default)]
    pub config: ConfigStore,
    /// Maintenance mode.
    #[serde(default)]
    pub maintenance: MaintenanceMode,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
}

impl ManagerState {
    /// Creates an empty state with the default tenant.
    #[must_use]
    pub fn new(encryption_key: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            encryption_key: encryption_key.to_string(),
            tenants: vec![Tenant {
                name: crate::manager::DEFAULT_TENANT.to_string(),
            }],
            blueprints: BTreeMap::new(),
            deployments: BTreeMap::new(),
            node_instances: BTreeMap::new(),
            executions: BTreeMap::new(),
            events: Vec::new(),
            audit_log: Vec::new(),
            secrets: BTreeMap::new(),
            plugins: BTreeMap::new(),
            agents: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            deployment_updates: BTreeMap::new(),
            config: ConfigStore::default(),
            maintenance: MaintenanceMode::default(),
            last_updated: Utc::now(),
        }
    }

    /// Marks the state as modified.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Appends an audit entry, dropping the oldest beyond the cap.
    pub fn add_audit(&mut self, entry: AuditEntry) {
        if self.audit_log.len() >= MAX_AUDIT_ENTRIES {
            self.audit_log.remove(0);
        }
        self.audit_log.push(entry);
    }

    /// Returns the node instances of a deployment, ordered by id.
    #[must_use]
    pub fn instances_of(&self, deployment_id: &str) -> Vec<&NodeInstance> {
        self.node_instances
            .values()
            .filter(|i| i.deployment_id == deployment_id)
            .collect()
    }

    /// Makes the instances of a deployment match its topology.
    ///
    /// Nodes without an instance get one; instances of nodes that are gone
    /// are dropped. Returns the ids of the created instances.
    pub fn sync_node_instances(&mut self, deployment_id: &str, topology: &Topology) -> Vec<String> {
        self.node_instances.retain(|_, instance| {
            instance.deployment_id != deployment_id || topology.nodes.contains_key(&instance.node_id)
        });

        let mut created = Vec::new();
        for node_id in topology.nodes.keys() {
            let exists = self
                .node_instances
                .values()
                .any(|i| i.deployment_id == deployment_id && &i.node_id == node_id);
            if exists {
                continue;
            }
            let suffix = &Uuid::new_v4().simple().to_string()[..6];
            let instance = NodeInstance {
                id: format!("{node_id}_{suffix}"),
                deployment_id: deployment_id.to_string(),
                node_id: node_id.clone(),
                index: 1,
                state: String::from("uninitialized"),
                runtime_properties: BTreeMap::new(),
            };
            created.push(instance.id.clone());
            self.node_instances.insert(instance.id.clone(), instance);
        }
        created
    }

    /// Removes a deployment and everything scoped to it.
    pub fn remove_deployment(&mut self, deployment_id: &str) -> Option<Deployment> {
        let removed = self.deployments.remove(deployment_id)?;
        self.node_instances
            .retain(|_, i| i.deployment_id != deployment_id);
        self.agents
            .retain(|_, a| a.deployment_id.as_deref() != Some(deployment_id));
        self.dependencies
            .retain(|_, d| d.source_deployment_id != deployment_id);
        self.touch();
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Node;
    use crate::manager::Visibility;
    use serde_json::json;

    fn deployment(id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            tenant: String::from("default_tenant"),
            blueprint_id: String::from("bp"),
            inputs: json!({}),
            topology: Topology::default(),
            runtime_only_evaluation: false,
            visibility: Visibility::Tenant,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_sync_node_instances() {
        let mut state = ManagerState::new("key");
        let mut topology = Topology::default();
        topology.nodes.insert(String::from("vm"), Node::new("t.vm"));
        topology.nodes.insert(String::from("db"), Node::new("t.db"));

        let created = state.sync_node_instances("dep", &topology);
        assert_eq!(created.len(), 2);
        assert!(state.sync_node_instances("dep", &topology).is_empty());

        topology.nodes.remove("db");
        topology.nodes.insert(String::from("cache"), Node::new("t.cache"));
        let created = state.sync_node_instances("dep", &topology);
        assert_eq!(created.len(), 1);
        assert!(created[0].starts_with("cache_"));

        let nodes: Vec<&str> = state
            .instances_of("dep")
            .iter()
            .map(|i| i.node_id.as_str())
            .collect();
        assert!(nodes.contains(&"vm"));
        assert!(nodes.contains(&"cache"));
        assert!(!nodes.contains(&"db"));
    }

    #[test]
    fn test_remove_deployment_cascades() {
        let mut state = ManagerState::new("key");
        state.deployments.insert(String::from("dep"), deployment("dep"));
        let mut topology = Topology::default();
        topology.nodes.insert(String::from("vm"), Node::new("t.vm"));
        state.sync_node_instances("dep", &topology);
        state.sync_node_instances("other", &topology);

        assert!(state.remove_deployment("dep").is_some());
        assert!(state.instances_of("dep").is_empty());
        assert_eq!(state.instances_of("other").len(), 1);
        assert!(state.remove_deployment("dep").is_none());
    }

    #[test]
    fn test_audit_cap() {
        let mut state = ManagerState::new("key");
        for i in 0..=MAX_AUDIT_ENTRIES {
            state.add_audit(AuditEntry {
                operation: String::from("op"),
                message: i.to_string(),
                actor: String::from("admin"),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(state.audit_log.len(), MAX_AUDIT_ENTRIES);
        assert_eq!(state.audit_log[0].message, "1");
    }
}
