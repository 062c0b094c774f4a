//! Entity changes ("steps") produced by the diff engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::topology::PATH_SEPARATOR;

/// Kind of entity a step addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A node.
    Node,
    /// A relationship of a node.
    Relationship,
    /// A node property.
    Property,
    /// A node operation.
    Operation,
    /// A workflow.
    Workflow,
    /// An output.
    Output,
    /// The topology description.
    Description,
}

/// What a step does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Entity only exists in the new topology.
    Add,
    /// Entity only exists in the old topology.
    Remove,
    /// Entity exists in both with a different value.
    Modify,
}

/// Ripple classification of a node touched by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeModificationType {
    /// Node was added.
    AddedAndRelated,
    /// Node gained relationships.
    ExtendedAndRelated,
    /// Node lost relationships.
    ReducedAndRelated,
    /// Node was removed.
    RemovedAndRelated,
    /// Node is the target of a changed relationship.
    Affected,
    /// Node is still related to a node that lost relationships.
    Related,
}

impl NodeModificationType {
    /// Higher wins when a node is classified more than once.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::AddedAndRelated | Self::RemovedAndRelated => 3,
            Self::ExtendedAndRelated | Self::ReducedAndRelated => 2,
            Self::Affected => 1,
            Self::Related => 0,
        }
    }
}

/// One detected difference between two topologies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Action to perform.
    pub action: ActionType,
    /// Path of the entity, segments joined by [`PATH_SEPARATOR`].
    pub entity_id: String,
    /// Ripple classification, for node and relationship steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<NodeModificationType>,
    /// New value of the entity, absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Parsed form of an entity path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPath<'a> {
    /// `nodes:<id>`
    Node(&'a str),
    /// `nodes:<source>:relationships:<target>`
    Relationship(&'a str, &'a str),
    /// `nodes:<id>:properties:<name>`
    Property(&'a str, &'a str),
    /// `nodes:<id>:operations:<name>`
    Operation(&'a str, &'a str),
    /// `workflows:<name>`
    Workflow(&'a str),
    /// `outputs:<name>`
    Output(&'a str),
    /// `description`
    Description,
}

impl EntityPath<'_> {
    /// Renders the path.
    #[must_use]
    pub fn render(&self) -> String {
        let sep = PATH_SEPARATOR;
        match self {
            Self::Node(id) => format!("nodes{sep}{id}"),
            Self::Relationship(src, dst) => format!("nodes{sep}{src}{sep}relationships{sep}{dst}"),
            Self::Property(id, name) => format!("nodes{sep}{id}{sep}properties{sep}{name}"),
            Self::Operation(id, name) => format!("nodes{sep}{id}{sep}operations{sep}{name}"),
            Self::Workflow(name) => format!("workflows{sep}{name}"),
            Self::Output(name) => format!("outputs{sep}{name}"),
            Self::Description => String::from("description"),
        }
    }
}

impl<'a> EntityPath<'a> {
    /// Parses an entity path. The last segment may contain the separator.
    #[must_use]
    pub fn parse(path: &'a str) -> Option<Self> {
        if path == "description" {
            return Some(Self::Description);
        }
        let (root, rest) = path.split_once(PATH_SEPARATOR)?;
        match root {
            "workflows" => Some(Self::Workflow(rest)),
            "outputs" => Some(Self::Output(rest)),
            "nodes" => {
                let mut parts = rest.splitn(3, PATH_SEPARATOR);
                let node = parts.next()?;
                match (parts.next(), parts.next()) {
                    (None, None) => Some(Self::Node(node)),
                    (Some("relationships"), Some(target)) => Some(Self::Relationship(node, target)),
                    (Some("properties"), Some(name)) => Some(Self::Property(node, name)),
                    (Some("operations"), Some(name)) => Some(Self::Operation(node, name)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl EntityChange {
    /// Creates a step.
    #[must_use]
    pub fn new(entity_type: EntityType, action: ActionType, path: &EntityPath<'_>) -> Self {
        Self {
            entity_type,
            action,
            entity_id: path.render(),
            modification: None,
            value: None,
        }
    }

    /// Sets the new value.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the ripple classification.
    #[must_use]
    pub const fn with_modification(mut self, modification: NodeModificationType) -> Self {
        self.modification = Some(modification);
        self
    }

    /// Parses the entity path.
    #[must_use]
    pub fn path(&self) -> Option<EntityPath<'_>> {
        EntityPath::parse(&self.entity_id)
    }

    /// Rank of the step in application order.
    ///
    /// Removals come first (relationships before nodes), then additions
    /// (nodes before relationships), then modifications.
    const fn rank(&self) -> (u8, u8) {
        let action = match self.action {
            ActionType::Remove => 0,
            ActionType::Add => 1,
            ActionType::Modify => 2,
        };
        let entity = match (self.action, self.entity_type) {
            (ActionType::Remove, EntityType::Relationship) => 0,
            (ActionType::Remove, EntityType::Node) => 1,
            (_, EntityType::Node) => 0,
            (_, EntityType::Relationship) => 1,
            (_, EntityType::Property) => 2,
            (_, EntityType::Operation) => 3,
            (_, EntityType::Workflow) => 4,
            (_, EntityType::Output) => 5,
            (_, EntityType::Description) => 6,
        };
        (action, entity)
    }

    /// Total order used to sort diff results.
    #[must_use]
    pub fn application_order(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.entity_id.cmp(&other.entity_id))
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Modify => "modify",
        })
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::Relationship => "relationship",
            Self::Property => "property",
            Self::Operation => "operation",
            Self::Workflow => "workflow",
            Self::Output => "output",
            Self::Description => "description",
        })
    }
}

impl fmt::Display for EntityChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action, self.entity_type, self.entity_id)
    }
}
