//! Topology model of a deployment.
//!
//! A topology is the graph of nodes and relationships plus the workflows,
//! outputs and description declared by a blueprint revision. Maps are
//! ordered so that serialization (and therefore hashing) is deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Reserved separator used in entity paths.
pub const PATH_SEPARATOR: char = ':';

/// The complete topology of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Nodes by id.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    /// Workflows by name.
    #[serde(default)]
    pub workflows: BTreeMap<String, Value>,
    /// Outputs by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// A node of the topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node type. Required.
    #[serde(rename = "type", default)]
    pub node_type: String,
    /// Node properties.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Operations by name.
    #[serde(default)]
    pub operations: BTreeMap<String, Value>,
    /// Outgoing relationships.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

/// A relationship from one node to another.
///
/// A source holds at most one relationship per target, so the target id
/// identifies the relationship.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship type. Required.
    #[serde(rename = "type", default)]
    pub rel_type: String,
    /// Target node id.
    pub target_id: String,
    /// Relationship properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    /// Operations run on the source side.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_operations: BTreeMap<String, Value>,
    /// Operations run on the target side.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_operations: BTreeMap<String, Value>,
}

impl Topology {
    /// Checks the structural invariants of the topology.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (node_id, node) in &self.nodes {
            if node_id.is_empty() {
                return Err(String::from("node with empty id"));
            }
            if node_id.contains(PATH_SEPARATOR) {
                return Err(format!(
                    "node id '{node_id}' contains the reserved separator '{PATH_SEPARATOR}'"
                ));
            }
            if node.node_type.is_empty() {
                return Err(format!("node '{node_id}' is missing its type"));
            }

            let mut targets = BTreeSet::new();
            for rel in &node.relationships {
                if rel.rel_type.is_empty() {
                    return Err(format!(
                        "relationship '{node_id}' -> '{}' is missing its type",
                        rel.target_id
                    ));
                }
                if !self.nodes.contains_key(&rel.target_id) {
                    return Err(format!(
                        "node '{node_id}' has a relationship to unknown node '{}'",
                        rel.target_id
                    ));
                }
                if !targets.insert(rel.target_id.as_str()) {
                    return Err(format!(
                        "node '{node_id}' has more than one relationship to '{}'",
                        rel.target_id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns a copy with relationships sorted by target.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut topology = self.clone();
        for node in topology.nodes.values_mut() {
            node.relationships
                .sort_by(|a, b| a.target_id.cmp(&b.target_id));
        }
        topology
    }

    /// Returns true if both topologies are equal modulo relationship order.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }

    /// Ids of the nodes having a relationship targeting `node_id`.
    #[must_use]
    pub fn sources_of(&self, node_id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.relationship(node_id).is_some())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

impl Node {
    /// Creates a node of the given type.
    #[must_use]
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            ..Self::default()
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Adds a relationship to `target_id`.
    #[must_use]
    pub fn with_relationship(
        mut self,
        rel_type: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        self.relationships.push(Relationship {
            rel_type: rel_type.into(),
            target_id: target_id.into(),
            ..Relationship::default()
        });
        self
    }

    /// Returns the relationship to `target_id`, if any.
    #[must_use]
    pub fn relationship(&self, target_id: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.target_id == target_id)
    }

    /// Ids of all relationship targets.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.relationships.iter().map(|r| r.target_id.as_str())
    }
}
