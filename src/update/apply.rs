//! Application of diff steps to a topology.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::step::{ActionType, EntityChange, EntityPath};
use crate::error::{DiffError, Result};
use crate::topology::{Node, Relationship, Topology};

fn required_value<'a>(step: &'a EntityChange) -> Result<&'a Value> {
    step.value
        .as_ref()
        .ok_or_else(|| DiffError::invalid_step(&step.entity_id, "missing value").into())
}

fn decode<T: DeserializeOwned>(step: &EntityChange) -> Result<T> {
    let value = required_value(step)?;
    serde_json::from_value(value.clone())
        .map_err(|e| DiffError::invalid_step(&step.entity_id, e.to_string()).into())
}

fn node_mut<'t>(topology: &'t mut Topology, id: &str, step: &EntityChange) -> Result<&'t mut Node> {
    topology
        .nodes
        .get_mut(id)
        .ok_or_else(|| {
            DiffError::invalid_step(&step.entity_id, format!("unknown node '{id}'")).into()
        })
}

/// Applies `steps` in order to a copy of `topology`.
///
/// # Errors
///
/// Returns an error if a step has an unparseable path, lacks the value it
/// needs, or addresses an entity that is not there.
pub fn apply_steps(topology: &Topology, steps: &[EntityChange]) -> Result<Topology> {
    let mut result = topology.clone();
    for step in steps {
        apply_step(&mut result, step)?;
    }
    Ok(result)
}

fn apply_step(topology: &mut Topology, step: &EntityChange) -> Result<()> {
    let path = step
        .path()
        .ok_or_else(|| DiffError::invalid_step(&step.entity_id, "unparseable entity path"))?;

    match (path, step.action) {
        (EntityPath::Node(id), ActionType::Remove) => {
            if topology.nodes.remove(id).is_none() {
                return Err(DiffError::invalid_step(&step.entity_id, "node does not exist").into());
            }
        }
        (EntityPath::Node(id), _) => {
            let node: Node = decode(step)?;
            topology.nodes.insert(id.to_string(), node);
        }
        (EntityPath::Relationship(source, target), action) => {
            let node = node_mut(topology, source, step)?;
            node.relationships.retain(|r| r.target_id != target);
            if action != ActionType::Remove {
                let rel: Relationship = decode(step)?;
                node.relationships.push(rel);
            }
        }
        (EntityPath::Property(id, name), action) => {
            let node = node_mut(topology, id, step)?;
            if action == ActionType::Remove {
                node.properties.remove(name);
            } else {
                node.properties.insert(name.to_string(), required_value(step)?.clone());
            }
        }
        (EntityPath::Operation(id, name), action) => {
            let node = node_mut(topology, id, step)?;
            if action == ActionType::Remove {
                node.operations.remove(name);
            } else {
                node.operations.insert(name.to_string(), required_value(step)?.clone());
            }
        }
        (EntityPath::Workflow(name), ActionType::Remove) => {
            topology.workflows.remove(name);
        }
        (EntityPath::Workflow(name), _) => {
            topology
                .workflows
                .insert(name.to_string(), required_value(step)?.clone());
        }
        (EntityPath::Output(name), ActionType::Remove) => {
            topology.outputs.remove(name);
        }
        (EntityPath::Output(name), _) => {
            topology
                .outputs
                .insert(name.to_string(), required_value(step)?.clone());
        }
        (EntityPath::Description, ActionType::Remove) => topology.description = None,
        (EntityPath::Description, _) => {
            topology.description = Some(decode::<String>(step)?);
        }
    }
    Ok(())
}
