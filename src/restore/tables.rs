//! Typed snapshot tables, in the shape the importer expects.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::manager::{
    Agent, Blueprint, Deployment, Event, Execution, InterDeploymentDependency, NodeInstance,
    Tenant, Visibility,
};

/// Table names, in import order. Plugins are installed one by one between
/// secrets and executions.
pub const TENANTS: &str = "tenants";
/// Blueprints table.
pub const BLUEPRINTS: &str = "blueprints";
/// Deployments table.
pub const DEPLOYMENTS: &str = "deployments";
/// Node instances table.
pub const NODE_INSTANCES: &str = "node_instances";
/// Secrets table.
pub const SECRETS: &str = "secrets";
/// Plugins table.
pub const PLUGINS: &str = "plugins";
/// Executions table.
pub const EXECUTIONS: &str = "executions";
/// Events and logs table.
pub const EVENTS: &str = "events";
/// Agents table.
pub const AGENTS: &str = "agents";
/// Inter-deployment dependencies table.
pub const DEPENDENCIES: &str = "inter_deployment_dependencies";

/// A secret whose value has been decrypted for import.
#[derive(Clone, PartialEq, Eq)]
pub struct PlainSecret {
    /// Secret key.
    pub key: String,
    /// Owning tenant.
    pub tenant: String,
    /// Plaintext value.
    pub value: String,
    /// Visibility.
    pub visibility: Visibility,
    /// Whether the value is hidden from users without access.
    pub is_hidden_value: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for PlainSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainSecret")
            .field("key", &self.key)
            .field("tenant", &self.tenant)
            .field("value", &"<redacted>")
            .field("is_hidden_value", &self.is_hidden_value)
            .finish_non_exhaustive()
    }
}

/// One migrated table, ready for import.
#[derive(Debug, Clone, PartialEq)]
pub enum TableData {
    /// Tenants.
    Tenants(Vec<Tenant>),
    /// Blueprints.
    Blueprints(Vec<Blueprint>),
    /// Deployments.
    Deployments(Vec<Deployment>),
    /// Node instances.
    NodeInstances(Vec<NodeInstance>),
    /// Secrets with plaintext values.
    Secrets(Vec<PlainSecret>),
    /// Executions.
    Executions(Vec<Execution>),
    /// Events and logs.
    Events(Vec<Event>),
    /// Agents.
    Agents(Vec<Agent>),
    /// Inter-deployment dependencies.
    Dependencies(Vec<InterDeploymentDependency>),
}

impl TableData {
    /// Table name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tenants(_) => TENANTS,
            Self::Blueprints(_) => BLUEPRINTS,
            Self::Deployments(_) => DEPLOYMENTS,
            Self::NodeInstances(_) => NODE_INSTANCES,
            Self::Secrets(_) => SECRETS,
            Self::Executions(_) => EXECUTIONS,
            Self::Events(_) => EVENTS,
            Self::Agents(_) => AGENTS,
            Self::Dependencies(_) => DEPENDENCIES,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Tenants(rows) => rows.len(),
            Self::Blueprints(rows) => rows.len(),
            Self::Deployments(rows) => rows.len(),
            Self::NodeInstances(rows) => rows.len(),
            Self::Secrets(rows) => rows.len(),
            Self::Executions(rows) => rows.len(),
            Self::Events(rows) => rows.len(),
            Self::Agents(rows) => rows.len(),
            Self::Dependencies(rows) => rows.len(),
        }
    }

    /// Returns true if the table holds no record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
