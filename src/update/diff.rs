//! Entity diff engine.
//!
//! Compares two topologies entity by entity and produces the ordered list
//! of steps that turns the old one into the new one, plus the ripple
//! classification of every node touched by the change.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::step::{ActionType, EntityChange, EntityPath, EntityType, NodeModificationType};
use crate::error::{DiffError, ManagerError, Result};
use crate::topology::{Node, Topology};

/// Result of a diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    /// Steps in application order.
    pub steps: Vec<EntityChange>,
    /// Ripple classification by node id.
    pub modified_nodes: BTreeMap<String, NodeModificationType>,
}

impl DiffResult {
    /// Returns true if the topologies are identical.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps with the given action.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }
}

/// Engine for computing topology diffs.
#[derive(Debug, Default)]
pub struct DiffEngine;

#[derive(Default)]
struct Collector {
    steps: Vec<EntityChange>,
    modified_nodes: BTreeMap<String, NodeModificationType>,
}

impl Collector {
    fn push(&mut self, step: EntityChange) {
        self.steps.push(step);
    }

    /// Records a classification unless the node already has a stronger one.
    fn mark(&mut self, node_id: &str, modification: NodeModificationType) {
        let keep = self
            .modified_nodes
            .get(node_id)
            .is_some_and(|current| current.priority() >= modification.priority());
        if !keep {
            self.modified_nodes.insert(node_id.to_string(), modification);
        }
    }
}

fn to_value<T: Serialize>(entity_id: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ManagerError::from(DiffError::invalid_step(entity_id, e.to_string())))
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the steps turning `old` into `new`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if either topology is malformed or a node
    /// changed its type. Nothing is partially computed.
    pub fn diff(&self, old: &Topology, new: &Topology) -> Result<DiffResult> {
        old.validate().map_err(|m| DiffError::malformed("old", m))?;
        new.validate().map_err(|m| DiffError::malformed("new", m))?;

        let mut out = Collector::default();

        Self::diff_nodes(old, new, &mut out)?;
        Self::diff_map(
            &old.workflows,
            &new.workflows,
            EntityType::Workflow,
            EntityPath::Workflow,
            &mut out,
        );
        Self::diff_map(
            &old.outputs,
            &new.outputs,
            EntityType::Output,
            EntityPath::Output,
            &mut out,
        );
        Self::diff_description(old, new, &mut out);

        out.steps.sort_by(EntityChange::application_order);

        debug!(
            "Diff computed: {} steps, {} nodes touched",
            out.steps.len(),
            out.modified_nodes.len()
        );

        Ok(DiffResult {
            steps: out.steps,
            modified_nodes: out.modified_nodes,
        })
    }

    fn diff_nodes(old: &Topology, new: &Topology, out: &mut Collector) -> Result<()> {
        for (id, node) in &new.nodes {
            match old.nodes.get(id) {
                None => {
                    let path = EntityPath::Node(id);
                    let value = to_value(&path.render(), node)?;
                    out.push(
                        EntityChange::new(EntityType::Node, ActionType::Add, &path)
                            .with_value(value)
                            .with_modification(NodeModificationType::AddedAndRelated),
                    );
                    out.mark(id, NodeModificationType::AddedAndRelated);
                    for target in node.targets() {
                        out.mark(target, NodeModificationType::Affected);
                    }
                }
                Some(previous) => {
                    if previous.node_type != node.node_type {
                        return Err(DiffError::NodeTypeChanged {
                            node_id: id.clone(),
                            old_type: previous.node_type.clone(),
                            new_type: node.node_type.clone(),
                        }
                        .into());
                    }
                    Self::diff_node(id, previous, node, new, out)?;
                }
            }
        }

        for (id, node) in &old.nodes {
            if new.nodes.contains_key(id) {
                continue;
            }
            out.push(
                EntityChange::new(EntityType::Node, ActionType::Remove, &EntityPath::Node(id))
                    .with_modification(NodeModificationType::RemovedAndRelated),
            );
            out.mark(id, NodeModificationType::RemovedAndRelated);
            for target in node.targets().filter(|t| new.nodes.contains_key(*t)) {
                out.mark(target, NodeModificationType::Affected);
            }
        }

        Ok(())
    }

    fn diff_node(
        id: &str,
        old: &Node,
        new: &Node,
        new_topology: &Topology,
        out: &mut Collector,
    ) -> Result<()> {
        Self::diff_map(
            &old.properties,
            &new.properties,
            EntityType::Property,
            |name| EntityPath::Property(id, name),
            out,
        );
        Self::diff_map(
            &old.operations,
            &new.operations,
            EntityType::Operation,
            |name| EntityPath::Operation(id, name),
            out,
        );

        let mut reduced = false;

        for rel in &new.relationships {
            let path = EntityPath::Relationship(id, &rel.target_id);
            match old.relationship(&rel.target_id) {
                None => {
                    let value = to_value(&path.render(), rel)?;
                    out.push(
                        EntityChange::new(EntityType::Relationship, ActionType::Add, &path)
                            .with_value(value)
                            .with_modification(NodeModificationType::ExtendedAndRelated),
                    );
                    out.mark(id, NodeModificationType::ExtendedAndRelated);
                    out.mark(&rel.target_id, NodeModificationType::Affected);
                }
                Some(previous) if previous != rel => {
                    let value = to_value(&path.render(), rel)?;
                    out.push(
                        EntityChange::new(EntityType::Relationship, ActionType::Modify, &path)
                            .with_value(value),
                    );
                    out.mark(&rel.target_id, NodeModificationType::Affected);
                }
                Some(_) => {}
            }
        }

        for rel in &old.relationships {
            if new.relationship(&rel.target_id).is_some() {
                continue;
            }
            out.push(
                EntityChange::new(
                    EntityType::Relationship,
                    ActionType::Remove,
                    &EntityPath::Relationship(id, &rel.target_id),
                )
                .with_modification(NodeModificationType::ReducedAndRelated),
            );
            out.mark(id, NodeModificationType::ReducedAndRelated);
            if new_topology.nodes.contains_key(&rel.target_id) {
                out.mark(&rel.target_id, NodeModificationType::Affected);
            }
            reduced = true;
        }

        if reduced {
            for target in new.targets() {
                out.mark(target, NodeModificationType::Related);
            }
        }

        Ok(())
    }

    fn diff_map<'a, F>(
        old: &'a BTreeMap<String, Value>,
        new: &'a BTreeMap<String, Value>,
        entity_type: EntityType,
        path: F,
        out: &mut Collector,
    ) where
        F: Fn(&'a str) -> EntityPath<'a>,
    {
        for (name, value) in new {
            match old.get(name) {
                None => out.push(
                    EntityChange::new(entity_type, ActionType::Add, &path(name.as_str()))
                        .with_value(value.clone()),
                ),
                Some(previous) if previous != value => out.push(
                    EntityChange::new(entity_type, ActionType::Modify, &path(name.as_str()))
                        .with_value(value.clone()),
                ),
                Some(_) => {}
            }
        }
        for name in old.keys() {
            if !new.contains_key(name) {
                out.push(EntityChange::new(entity_type, ActionType::Remove, &path(name.as_str())));
            }
        }
    }

    fn diff_description(old: &Topology, new: &Topology, out: &mut Collector) {
        let action = match (&old.description, &new.description) {
            (None, Some(_)) => ActionType::Add,
            (Some(_), None) => ActionType::Remove,
            (Some(a), Some(b)) if a != b => ActionType::Modify,
            _ => return,
        };
        let mut step = EntityChange::new(EntityType::Description, action, &EntityPath::Description);
        if let Some(text) = &new.description {
            step = step.with_value(Value::String(text.clone()));
        }
        out.push(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Relationship;
    use serde_json::json;

    fn base() -> Topology {
        let mut t = Topology::default();
        t.description = Some(String::from("v1"));
        t.nodes.insert(
            String::from("db"),
            Node::new("stratus.nodes.Database").with_property("port", json!(5432)),
        );
        t.nodes.insert(
            String::from("app"),
            Node::new("stratus.nodes.WebServer").with_relationship("connected_to", "db"),
        );
        t.workflows.insert(String::from("install"), json!("lifecycle.install"));
        t
    }

    fn ids(result: &DiffResult) -> Vec<&str> {
        result.steps.iter().map(|s| s.entity_id.as_str()).collect()
    }

    #[test]
    fn test_identical_topologies() {
        let result = DiffEngine::new().diff(&base(), &base()).unwrap();
        assert!(result.is_empty());
        assert!(result.modified_nodes.is_empty());
    }

    #[test]
    fn test_added_node_affects_targets() {
        let old = base();
        let mut new = base();
        new.nodes.insert(
            String::from("cache"),
            Node::new("stratus.nodes.Cache").with_relationship("connected_to", "db"),
        );

        let result = DiffEngine::new().diff(&old, &new).unwrap();

        assert_eq!(ids(&result), vec!["nodes:cache"]);
        assert_eq!(result.steps[0].action, ActionType::Add);
        assert_eq!(
            result.modified_nodes.get("cache"),
            Some(&NodeModificationType::AddedAndRelated)
        );
        assert_eq!(
            result.modified_nodes.get("db"),
            Some(&NodeModificationType::Affected)
        );
    }

    #[test]
    fn test_removal_order() {
        let old = base();
        let mut new = base();
        new.nodes.remove("db");
        if let Some(app) = new.nodes.get_mut("app") {
            app.relationships.clear();
        }

        let result = DiffEngine::new().diff(&old, &new).unwrap();

        assert_eq!(ids(&result), vec!["nodes:app:relationships:db", "nodes:db"]);
        assert_eq!(
            result.modified_nodes.get("app"),
            Some(&NodeModificationType::ReducedAndRelated)
        );
        assert_eq!(
            result.modified_nodes.get("db"),
            Some(&NodeModificationType::RemovedAndRelated)
        );
    }

    #[test]
    fn test_addition_order_and_reduced_related() {
        let mut old = base();
        old.nodes.insert(String::from("queue"), Node::new("stratus.nodes.Queue"));
        if let Some(app) = old.nodes.get_mut("app") {
            app.relationships.push(Relationship {
                rel_type: String::from("connected_to"),
                target_id: String::from("queue"),
                ..Relationship::default()
            });
        }

        let mut new = old.clone();
        new.nodes.insert(String::from("cache"), Node::new("stratus.nodes.Cache"));
        if let Some(app) = new.nodes.get_mut("app") {
            app.relationships.retain(|r| r.target_id != "queue");
            app.relationships.push(Relationship {
                rel_type: String::from("connected_to"),
                target_id: String::from("cache"),
                ..Relationship::default()
            });
        }

        let result = DiffEngine::new().diff(&old, &new).unwrap();

        assert_eq!(
            ids(&result),
            vec![
                "nodes:app:relationships:queue",
                "nodes:cache",
                "nodes:app:relationships:cache",
            ]
        );
        // extended and reduced share a priority; the first classification stays
        assert_eq!(
            result.modified_nodes.get("app"),
            Some(&NodeModificationType::ExtendedAndRelated)
        );
        assert_eq!(
            result.modified_nodes.get("cache"),
            Some(&NodeModificationType::AddedAndRelated)
        );
        assert_eq!(
            result.modified_nodes.get("queue"),
            Some(&NodeModificationType::Affected)
        );
        assert_eq!(
            result.modified_nodes.get("db"),
            Some(&NodeModificationType::Related)
        );
    }

    #[test]
    fn test_modifications() {
        let old = base();
        let mut new = base();
        new.description = Some(String::from("v2"));
        new.workflows.insert(String::from("install"), json!("lifecycle.install_v2"));
        new.outputs.insert(String::from("url"), json!({"value": "http://app"}));
        if let Some(db) = new.nodes.get_mut("db") {
            db.properties.insert(String::from("port"), json!(5433));
            db.operations.insert(String::from("start"), json!("start.sh"));
        }

        let result = DiffEngine::new().diff(&old, &new).unwrap();

        assert_eq!(result.count(ActionType::Add), 2);
        assert_eq!(result.count(ActionType::Modify), 3);
        assert_eq!(
            ids(&result),
            vec![
                "nodes:db:operations:start",
                "outputs:url",
                "nodes:db:properties:port",
                "workflows:install",
                "description",
            ]
        );
        assert!(result.modified_nodes.is_empty());
    }

    #[test]
    fn test_type_change_rejected() {
        let old = base();
        let mut new = base();
        if let Some(db) = new.nodes.get_mut("db") {
            db.node_type = String::from("stratus.nodes.Other");
        }
        let err = DiffEngine::new().diff(&old, &new).unwrap_err();
        assert!(err.to_string().contains("changed type"));
    }

    #[test]
    fn test_malformed_topology_rejected() {
        let old = base();
        let mut new = base();
        new.nodes.insert(String::from("untyped"), Node::default());
        let err = DiffEngine::new().diff(&old, &new).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("new"));
    }

    #[test]
    fn test_deterministic() {
        let old = base();
        let mut new = base();
        new.nodes.remove("app");
        new.nodes.insert(String::from("z"), Node::new("t").with_relationship("r", "db"));
        new.nodes.insert(String::from("a"), Node::new("t"));

        let first = DiffEngine::new().diff(&old, &new).unwrap();
        let second = DiffEngine::new().diff(&old, &new).unwrap();
        assert_eq!(first, second);
    }
}
