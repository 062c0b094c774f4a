//! CLI module for the Stratus manager.
//!
//! This module provides the command-line interface of the `stratus`
//! binary: command definitions and output formatting.

mod commands;
mod output;

pub use commands::{
    BlueprintCommands, Cli, Commands, ComponentCommands, ConfigCommands, DeploymentCommands,
    EventCommands, OutputFormat, SecretCommands, SnapshotCommands,
};
pub use output::OutputFormatter;
