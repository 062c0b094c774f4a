// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stratus Manager
//!
//! The orchestration core of a multi-tenant deployment manager.
//!
//! ## Overview
//!
//! Stratus tracks long-running deployments of blueprints and drives the two
//! workflows that change them in bulk:
//!
//! - **Deployment updates**: diff a deployment's topology against a new
//!   blueprint revision, dispatch the update workflow, then finalize the
//!   persisted topology while provisioning or tearing down nested
//!   components
//! - **Snapshot restores**: import a versioned snapshot archive into the
//!   manager under maintenance mode, migrating records of older versions
//!
//! Both end in a well-defined terminal state and never leave partially
//! applied changes unreported.
//!
//! ## Architecture
//!
//! Orchestrators talk to the manager only through the async contracts in
//! [`manager`]. Two backends implement them:
//!
//! 1. [`manager::LocalManager`]: an in-process manager persisted as JSON
//! 2. [`manager::RestClient`]: an HTTP client for a remote manager
//!
//! ## Modules
//!
//! - [`config`]: Settings registry, configuration files and stored entries
//! - [`topology`]: Topology model, parsing and fingerprinting
//! - [`update`]: Diff engine and the deployment update state machine
//! - [`component`]: Nested deployments with their secrets and plugins
//! - [`execution`]: Execution statuses and the execution poller
//! - [`manager`]: Collaborator contracts, records and backends
//! - [`state`]: Persistent state of the local manager
//! - [`restore`]: Snapshot archives, migrations and the restore orchestrator
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! description: web stack
//! nodes:
//!   web:
//!     type: stratus.nodes.Compute
//!     relationships:
//!       - type: connected_to
//!         target_id: db
//!   db:
//!     type: stratus.nodes.Database
//!     properties:
//!       port: 5432
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod component;
pub mod config;
pub mod error;
pub mod execution;
pub mod manager;
pub mod restore;
pub mod state;
pub mod topology;
pub mod update;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use component::{ComponentProvisioner, ComponentSpec};
pub use config::{ConfigContext, ConfigLoader, ManagerConfig};
pub use error::{ErrorKind, ManagerError, Result};
pub use execution::{ExecutionPoller, ExecutionStatus};
pub use manager::{LocalManager, ManagerClients, RestClient};
pub use restore::{RestoreOptions, RestoreReport, RestoreStatus, SnapshotRestorer};
pub use state::{LocalStateStore, ManagerState, StateStore};
pub use topology::{Topology, TopologyHasher, TopologyParser};
pub use update::{DeploymentUpdate, DiffEngine, UpdateState, UpdateStateMachine};
