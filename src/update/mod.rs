//! Deployment updates.
//!
//! This module provides:
//! - The entity diff engine comparing two topologies
//! - Application of diff steps to a topology
//! - The persisted update record and its state transitions
//! - The update state machine driving an update to a terminal state

mod apply;
mod diff;
mod machine;
mod state;
mod step;

pub use apply::apply_steps;
pub use diff::{DiffEngine, DiffResult};
pub use machine::{COMPONENT_NODE_TYPE, UpdateStateMachine};
pub use state::{DEFAULT_UPDATE_WORKFLOW, DeploymentUpdate, UpdatePhase, UpdateState};
pub use step::{ActionType, EntityChange, EntityPath, EntityType, NodeModificationType};
