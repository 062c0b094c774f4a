//! Components: nested deployments with their own secrets and plugins.
//!
//! This module provides:
//! - Parsing and validation of component node properties
//! - The ownership record kept in the owner's runtime properties
//! - Artifact fetching and plugin archive handling
//! - The provisioner creating and deleting components

pub mod archive;
mod fetch;
mod provisioner;
mod record;
mod spec;

pub use fetch::{ArtifactFetcher, HttpFetcher};
pub use provisioner::ComponentProvisioner;
pub use record::{ComponentRecord, DeploymentRef};
pub use spec::{ComponentSpec, DeploymentDescriptor, PluginSource};

#[cfg(test)]
pub use fetch::MockArtifactFetcher;
