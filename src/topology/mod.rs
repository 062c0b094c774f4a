//! Deployment topology model.
//!
//! Nodes, relationships, workflows, outputs and description of a blueprint
//! revision, plus parsing and fingerprinting.

mod hash;
mod parser;
mod types;

pub use hash::TopologyHasher;
pub use parser::TopologyParser;
pub use types::{Node, Relationship, Topology, PATH_SEPARATOR};
