//! Normalization of snapshot records produced by older versions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use tracing::{debug, warn};

use super::dump::SnapshotDump;
use super::tables::{
    AGENTS, BLUEPRINTS, DEPENDENCIES, DEPLOYMENTS, EVENTS, EXECUTIONS, NODE_INSTANCES,
    PLUGINS, PlainSecret, SECRETS, TENANTS, TableData,
};
use super::version::ManagerVersion;
use crate::error::{RestoreError, Result};
use crate::execution::ExecutionStatus;
use crate::manager::{
    AGENT_STATE_RESTORED, Agent, Blueprint, Deployment, Event, Execution,
    InterDeploymentDependency, NodeInstance, Plugin, Secret, SecretCipher, Tenant,
};

/// Error recorded on executions cut short by the snapshot.
pub const INTERRUPTED_MESSAGE: &str = "Execution was interrupted by a snapshot restore";

/// Error recorded on scheduled executions whose time passed.
pub const MISSED_SCHEDULE_MESSAGE: &str = "Scheduled time passed while the snapshot was restored";

/// Rewrites the tables of one snapshot into the current record shapes.
#[derive(Debug, Clone)]
pub struct Migrator {
    version: ManagerVersion,
    snapshot_cipher: Option<SecretCipher>,
    now: DateTime<Utc>,
}

impl Migrator {
    /// Creates a migrator for snapshots of `version`.
    ///
    /// `snapshot_cipher` decrypts secret values of versions that encrypt
    /// them.
    #[must_use]
    pub fn new(version: ManagerVersion, snapshot_cipher: Option<SecretCipher>) -> Self {
        Self {
            version,
            snapshot_cipher,
            now: Utc::now(),
        }
    }

    /// Creates a migrator for `dump`, loading its encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error if the version is unsupported or the key is invalid.
    pub fn for_dump(dump: &SnapshotDump) -> Result<Self> {
        let version = dump.version();
        version.ensure_supported()?;
        let cipher = if version >= ManagerVersion::HIDDEN_SECRETS {
            dump.encryption_key
                .as_deref()
                .map(SecretCipher::from_key)
                .transpose()?
        } else {
            None
        };
        Ok(Self::new(version, cipher))
    }

    /// Overrides the reference time for schedule checks.
    #[must_use]
    pub const fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Version the records come from.
    #[must_use]
    pub const fn version(&self) -> ManagerVersion {
        self.version
    }

    /// Tenants.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn tenants(&self, rows: &[Value]) -> Result<TableData> {
        decode_all::<Tenant>(TENANTS, rows).map(TableData::Tenants)
    }

    /// Blueprints; import links are dropped up to 4.5.0.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn blueprints(&self, rows: &[Value]) -> Result<TableData> {
        let mut blueprints = decode_all::<Blueprint>(BLUEPRINTS, rows)?;
        if self.version <= ManagerVersion::LAST_WITHOUT_BLUEPRINT_IMPORTS {
            for blueprint in &mut blueprints {
                blueprint.imported_blueprints.clear();
            }
        }
        Ok(TableData::Blueprints(blueprints))
    }

    /// Deployments; `runtime_only_evaluation` is off before 5.0.0.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn deployments(&self, rows: &[Value]) -> Result<TableData> {
        let mut deployments = decode_all::<Deployment>(DEPLOYMENTS, rows)?;
        if self.version < ManagerVersion::RUNTIME_ONLY_EVALUATION {
            for deployment in &mut deployments {
                deployment.runtime_only_evaluation = false;
            }
        }
        Ok(TableData::Deployments(deployments))
    }

    /// Node instances; indexes are assigned before 5.0.5 and wherever a
    /// record carries none.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn node_instances(&self, rows: &[Value]) -> Result<TableData> {
        let mut instances = decode_all::<NodeInstance>(NODE_INSTANCES, rows)?;
        let missing: Vec<bool> = if self.version < ManagerVersion::EXECUTION_TOKENS {
            vec![true; rows.len()]
        } else {
            rows.iter()
                .map(|row| row.get("index").is_none())
                .collect()
        };
        assign_indexes(&mut instances, &missing);
        Ok(TableData::NodeInstances(instances))
    }

    /// Secrets, with plaintext values.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode or decrypt.
    pub fn secrets(&self, rows: &[Value]) -> Result<TableData> {
        let secrets = decode_all::<Secret>(SECRETS, rows)?;
        let mut plain = Vec::with_capacity(secrets.len());

        for secret in secrets {
            let (value, is_hidden_value) = if self.version < ManagerVersion::HIDDEN_SECRETS {
                (secret.value, false)
            } else {
                let cipher = self.snapshot_cipher.as_ref().ok_or_else(|| RestoreError::Migration {
                    table: SECRETS,
                    id: secret.key.clone(),
                    message: String::from("snapshot has no encryption key"),
                })?;
                let value = cipher.decrypt(&secret.value).map_err(|e| RestoreError::Migration {
                    table: SECRETS,
                    id: secret.key.clone(),
                    message: e.to_string(),
                })?;
                (value, secret.is_hidden_value)
            };

            plain.push(PlainSecret {
                key: secret.key,
                tenant: secret.tenant,
                value,
                visibility: secret.visibility,
                is_hidden_value,
                created_at: secret.created_at,
                updated_at: secret.updated_at,
            });
        }
        Ok(TableData::Secrets(plain))
    }

    /// One plugin record. Plugins are migrated one at a time so a bad
    /// record only fails its own install.
    ///
    /// # Errors
    ///
    /// Returns `Migration` if the record does not decode, or if its id or
    /// archive name is not a plain file name.
    pub fn plugin(&self, row: &Value) -> Result<Plugin> {
        let plugin: Plugin = decode(PLUGINS, row)?;
        for (field, value) in [("id", &plugin.id), ("archive_name", &plugin.archive_name)] {
            if !is_file_name(value) {
                return Err(RestoreError::Migration {
                    table: PLUGINS,
                    id: plugin.id.clone(),
                    message: format!("{field} '{value}' is not a plain file name"),
                }
                .into());
            }
        }
        Ok(plugin)
    }

    /// Executions; interrupted and overdue executions become failed.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn executions(&self, rows: &[Value]) -> Result<TableData> {
        let mut executions = decode_all::<Execution>(EXECUTIONS, rows)?;
        for execution in &mut executions {
            if self.version < ManagerVersion::EXECUTION_TOKENS {
                execution.token = None;
                execution.blueprint_id = None;
            }
            self.settle(execution);
        }
        Ok(TableData::Executions(executions))
    }

    /// Events and logs.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn events(&self, rows: &[Value]) -> Result<TableData> {
        decode_all::<Event>(EVENTS, rows).map(TableData::Events)
    }

    /// Agents; older snapshots carry no usable broker settings and their
    /// agents are not restored.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn agents(&self, rows: &[Value]) -> Result<TableData> {
        if self.version < ManagerVersion::AGENT_BROKERS {
            if !rows.is_empty() {
                warn!(
                    "Skipping {} agent(s) from a {} snapshot",
                    rows.len(),
                    self.version
                );
            }
            return Ok(TableData::Agents(Vec::new()));
        }

        let mut agents = decode_all::<Agent>(AGENTS, rows)?;
        for agent in &mut agents {
            agent.state = String::from(AGENT_STATE_RESTORED);
            agent.broker_username = None;
            agent.broker_password = None;
            agent.broker_exchange = Some(agent.id.clone());
        }
        Ok(TableData::Agents(agents))
    }

    /// Inter-deployment dependencies, tracked from 5.0.5 on.
    ///
    /// # Errors
    ///
    /// Returns `Migration` for a record that does not decode.
    pub fn dependencies(&self, rows: &[Value]) -> Result<TableData> {
        if self.version < ManagerVersion::EXECUTION_TOKENS {
            return Ok(TableData::Dependencies(Vec::new()));
        }
        decode_all::<InterDeploymentDependency>(DEPENDENCIES, rows).map(TableData::Dependencies)
    }

    fn settle(&self, execution: &mut Execution) {
        let message = match execution.status {
            ExecutionStatus::Scheduled
                if execution.scheduled_for.is_some_and(|at| at <= self.now) =>
            {
                MISSED_SCHEDULE_MESSAGE
            }
            status if status.is_in_flight() => INTERRUPTED_MESSAGE,
            _ => return,
        };
        debug!(
            "Marking execution {} ({}) as failed",
            execution.id, execution.status
        );
        execution.status = ExecutionStatus::Failed;
        execution.error = String::from(message);
        execution.ended_at = Some(self.now);
    }
}

pub(super) fn record_id(row: &Value) -> String {
    ["id", "key", "name"]
        .iter()
        .find_map(|field| row.get(field).and_then(Value::as_str))
        .unwrap_or("<unknown>")
        .to_string()
}

/// Whether `value` names a single entry inside a directory.
fn is_file_name(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn decode<T: DeserializeOwned>(table: &'static str, row: &Value) -> Result<T> {
    T::deserialize(row).map_err(|e| {
        RestoreError::Migration {
            table,
            id: record_id(row),
            message: e.to_string(),
        }
        .into()
    })
}

fn decode_all<T: DeserializeOwned>(table: &'static str, rows: &[Value]) -> Result<Vec<T>> {
    rows.iter().map(|row| decode(table, row)).collect()
}

/// Numbers the instances flagged in `missing` per deployment and node,
/// after the highest index already present in that group.
fn assign_indexes(instances: &mut [NodeInstance], missing: &[bool]) {
    let mut by_node: BTreeMap<(String, String), (u32, Vec<usize>)> = BTreeMap::new();
    for (position, instance) in instances.iter().enumerate() {
        let group = by_node
            .entry((instance.deployment_id.clone(), instance.node_id.clone()))
            .or_default();
        if missing[position] {
            group.1.push(position);
        } else {
            group.0 = group.0.max(instance.index);
        }
    }
    for (taken, mut positions) in by_node.into_values() {
        positions.sort_by(|a, b| instances[*a].id.cmp(&instances[*b].id));
        for (index, position) in (taken + 1..).zip(positions) {
            instances[position].index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "workflow_id": "install",
            "status": status,
            "token": "tok",
            "blueprint_id": "bp",
            "created_at": "2024-01-01T00:00:00Z",
        })
    }

    #[test]
    fn test_old_secrets_pass_through() {
        let migrator = Migrator::new(ManagerVersion::new(4, 3, 0), None);
        let rows = [json!({
            "key": "db",
            "value": "plain",
            "is_hidden_value": true,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        })];

        let TableData::Secrets(secrets) = migrator.secrets(&rows).unwrap() else {
            panic!("expected secrets");
        };
        assert_eq!(secrets[0].value, "plain");
        assert!(!secrets[0].is_hidden_value);
    }

    #[test]
    fn test_new_secrets_are_decrypted() {
        let cipher = SecretCipher::generate();
        let rows = [json!({
            "key": "db",
            "value": cipher.encrypt("hunter2").unwrap(),
            "is_hidden_value": true,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        })];

        let migrator = Migrator::new(ManagerVersion::HIDDEN_SECRETS, Some(cipher));
        let TableData::Secrets(secrets) = migrator.secrets(&rows).unwrap() else {
            panic!("expected secrets");
        };
        assert_eq!(secrets[0].value, "hunter2");
        assert!(secrets[0].is_hidden_value);

        let keyless = Migrator::new(ManagerVersion::HIDDEN_SECRETS, None);
        let err = keyless.secrets(&rows).unwrap_err();
        assert!(err.to_string().contains("'db'"));
    }

    #[test]
    fn test_executions_settled() {
        let now = Utc::now();
        let mut scheduled = execution("e3", "scheduled");
        scheduled["scheduled_for"] = json!(now - chrono::Duration::hours(1));
        let mut future = execution("e4", "scheduled");
        future["scheduled_for"] = json!(now + chrono::Duration::hours(1));
        let rows = [
            execution("e1", "started"),
            execution("e2", "terminated"),
            scheduled,
            future,
        ];

        let migrator = Migrator::new(ManagerVersion::new(5, 0, 0), None).at(now);
        let TableData::Executions(executions) = migrator.executions(&rows).unwrap() else {
            panic!("expected executions");
        };
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert_eq!(executions[0].error, INTERRUPTED_MESSAGE);
        assert_eq!(executions[1].status, ExecutionStatus::Terminated);
        assert_eq!(executions[2].status, ExecutionStatus::Failed);
        assert_eq!(executions[2].error, MISSED_SCHEDULE_MESSAGE);
        assert_eq!(executions[3].status, ExecutionStatus::Scheduled);
        assert!(executions.iter().all(|e| e.token.is_none()));
    }

    #[test]
    fn test_tokens_kept_from_5_0_5() {
        let migrator = Migrator::new(ManagerVersion::EXECUTION_TOKENS, None);
        let TableData::Executions(executions) = migrator
            .executions(&[execution("e1", "terminated")])
            .unwrap()
        else {
            panic!("expected executions");
        };
        assert_eq!(executions[0].token.as_deref(), Some("tok"));
        assert_eq!(executions[0].blueprint_id.as_deref(), Some("bp"));
    }

    #[test]
    fn test_node_instance_indexes() {
        let rows = [
            json!({"id": "vm_b", "deployment_id": "d", "node_id": "vm"}),
            json!({"id": "db_a", "deployment_id": "d", "node_id": "db"}),
            json!({"id": "vm_a", "deployment_id": "d", "node_id": "vm"}),
        ];
        let migrator = Migrator::new(ManagerVersion::new(5, 0, 0), None);
        let TableData::NodeInstances(instances) = migrator.node_instances(&rows).unwrap() else {
            panic!("expected node instances");
        };
        let indexes: Vec<(&str, u32)> = instances
            .iter()
            .map(|i| (i.id.as_str(), i.index))
            .collect();
        assert_eq!(indexes, vec![("vm_b", 2), ("db_a", 1), ("vm_a", 1)]);
    }

    #[test]
    fn test_node_instance_indexes_per_deployment() {
        let rows = [
            json!({"id": "vm_a1", "deployment_id": "dep1", "node_id": "vm"}),
            json!({"id": "vm_b2", "deployment_id": "dep2", "node_id": "vm"}),
        ];
        let migrator = Migrator::new(ManagerVersion::new(5, 0, 0), None);
        let TableData::NodeInstances(instances) = migrator.node_instances(&rows).unwrap() else {
            panic!("expected node instances");
        };
        assert!(instances.iter().all(|i| i.index == 1));
    }

    #[test]
    fn test_missing_index_assigned_on_current_version() {
        let rows = [
            json!({"id": "vm_a1", "deployment_id": "dep1", "node_id": "vm", "index": 3}),
            json!({"id": "vm_a2", "deployment_id": "dep1", "node_id": "vm"}),
            json!({"id": "db_a1", "deployment_id": "dep1", "node_id": "db"}),
        ];
        let migrator = Migrator::new(ManagerVersion::CURRENT, None);
        let TableData::NodeInstances(instances) = migrator.node_instances(&rows).unwrap() else {
            panic!("expected node instances");
        };
        let indexes: Vec<u32> = instances.iter().map(|i| i.index).collect();
        assert_eq!(indexes, vec![3, 4, 1]);
    }

    #[test]
    fn test_agents_by_version() {
        let rows = [json!({
            "id": "agent_1",
            "name": "agent_1",
            "node_instance_id": "vm_1",
            "state": "started",
            "broker_username": "user",
            "broker_password": "pass",
        })];

        let old = Migrator::new(ManagerVersion::new(4, 4, 0), None);
        assert!(old.agents(&rows).unwrap().is_empty());

        let current = Migrator::new(ManagerVersion::AGENT_BROKERS, None);
        let TableData::Agents(agents) = current.agents(&rows).unwrap() else {
            panic!("expected agents");
        };
        assert_eq!(agents[0].state, AGENT_STATE_RESTORED);
        assert_eq!(agents[0].broker_username, None);
        assert_eq!(agents[0].broker_password, None);
        assert_eq!(agents[0].broker_exchange.as_deref(), Some("agent_1"));
    }

    #[test]
    fn test_plugin_paths_must_be_file_names() {
        let migrator = Migrator::new(ManagerVersion::CURRENT, None);
        let plugin = |id: &str, archive_name: &str| {
            json!({
                "id": id,
                "package_name": "pkg",
                "package_version": "1.0.0",
                "archive_name": archive_name,
                "uploaded_at": "2024-01-01T00:00:00Z",
            })
        };

        assert!(migrator.plugin(&plugin("p1", "p1.wgn")).is_ok());
        for (id, archive_name) in [
            ("p1", "../../state/state.json"),
            ("p1", "/etc/passwd"),
            ("p1", "nested/p1.wgn"),
            ("..", "p1.wgn"),
            ("a/b", "p1.wgn"),
            ("", "p1.wgn"),
        ] {
            let err = migrator.plugin(&plugin(id, archive_name)).unwrap_err();
            assert!(err.to_string().contains("not a plain file name"), "{id} {archive_name}");
        }
    }

    #[test]
    fn test_bad_record_names_table_and_id() {
        let migrator = Migrator::new(ManagerVersion::CURRENT, None);
        let err = migrator
            .plugin(&json!({"id": "p1", "package_name": 3}))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("plugins"));
        assert!(message.contains("'p1'"));
    }
}
