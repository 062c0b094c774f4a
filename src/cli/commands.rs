//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::manager::WORKFLOW_EVENT_TYPE;

/// Local manager directory name under the user's home.
pub const DEFAULT_HOME: &str = ".stratus";

/// Stratus - deployment manager orchestration core.
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// URL of a remote manager. The local manager is used when absent.
    #[arg(long, global = true, env = "STRATUS_MANAGER_URL")]
    pub manager_url: Option<String>,

    /// Bearer token for the remote manager.
    #[arg(long, global = true, env = "STRATUS_MANAGER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Tenant used for remote requests.
    #[arg(long, global = true, env = "STRATUS_TENANT", default_value = "default_tenant")]
    pub tenant: String,

    /// Directory of the local manager. Defaults to `~/.stratus`.
    #[arg(long, global = true, env = "STRATUS_HOME")]
    pub home: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the steps turning one topology into another.
    Diff {
        /// Current topology file.
        old: PathBuf,

        /// Target topology file.
        new: PathBuf,
    },

    /// Manage blueprints.
    Blueprints {
        /// Blueprint subcommand.
        #[command(subcommand)]
        command: BlueprintCommands,
    },

    /// Manage deployments.
    Deployments {
        /// Deployment subcommand.
        #[command(subcommand)]
        command: DeploymentCommands,
    },

    /// Update a deployment to another blueprint.
    Update {
        /// Deployment to update.
        deployment_id: String,

        /// Target blueprint.
        blueprint_id: String,

        /// Seconds to wait for the update workflow.
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Provision components directly.
    Component {
        /// Component subcommand.
        #[command(subcommand)]
        command: ComponentCommands,
    },

    /// Manage snapshots.
    Snapshots {
        /// Snapshot subcommand.
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Manage events.
    Events {
        /// Events subcommand.
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Manage secrets.
    Secrets {
        /// Secrets subcommand.
        #[command(subcommand)]
        command: SecretCommands,
    },

    /// Show or change configuration.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Blueprint subcommands.
#[derive(Subcommand, Debug)]
pub enum BlueprintCommands {
    /// Upload a topology file as a blueprint.
    Upload {
        /// Blueprint id.
        blueprint_id: String,

        /// Topology file (YAML or JSON).
        path: PathBuf,
    },

    /// List blueprints.
    List,
}

/// Deployment subcommands.
#[derive(Subcommand, Debug)]
pub enum DeploymentCommands {
    /// Create a deployment.
    Create {
        /// Deployment id.
        deployment_id: String,

        /// Blueprint to deploy.
        #[arg(short, long)]
        blueprint_id: String,

        /// Inputs file (YAML or JSON mapping).
        #[arg(short, long)]
        inputs: Option<PathBuf>,
    },

    /// Delete a deployment.
    Delete {
        /// Deployment id.
        deployment_id: String,
    },

    /// List deployments.
    List,
}

/// Component subcommands.
#[derive(Subcommand, Debug)]
pub enum ComponentCommands {
    /// Create the component described by a properties file.
    Create {
        /// Node instance owning the component.
        owner: String,

        /// Component properties file (YAML or JSON mapping).
        properties: PathBuf,

        /// Seconds to wait for the nested deployment.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Delete the component recorded on a node instance.
    Delete {
        /// Node instance owning the component.
        owner: String,

        /// Nested deployment id.
        deployment_id: String,

        /// Seconds to wait for the nested deployment to disappear.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

/// Snapshot subcommands.
#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Create a snapshot of the manager.
    Create {
        /// Snapshot id.
        snapshot_id: String,
    },

    /// Upload a snapshot archive.
    Upload {
        /// Snapshot id.
        snapshot_id: String,

        /// Archive file.
        path: PathBuf,
    },

    /// Restore a snapshot.
    Restore {
        /// Snapshot id.
        snapshot_id: String,

        /// Skip plugins that fail to install.
        #[arg(long)]
        ignore_plugin_failure: bool,
    },

    /// Show whether a restore is running.
    Status,

    /// List snapshots.
    List,
}

/// Events subcommands.
#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Delete the events of a deployment.
    Purge {
        /// Deployment id.
        deployment_id: String,

        /// Event types to delete.
        #[arg(long = "type", default_value = WORKFLOW_EVENT_TYPE)]
        event_types: Vec<String>,

        /// Also delete logs.
        #[arg(long)]
        include_logs: bool,

        /// Store deleted rows in this directory first.
        #[arg(long)]
        store_before: Option<PathBuf>,
    },
}

/// Secret subcommands.
#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    /// Create a secret.
    Create {
        /// Secret key.
        key: String,

        /// Secret value.
        value: String,

        /// Replace the value of an existing secret.
        #[arg(long)]
        update_if_exists: bool,

        /// Hide the value from users without access.
        #[arg(long)]
        hidden: bool,
    },

    /// Show a secret.
    Get {
        /// Secret key.
        key: String,
    },

    /// List secret keys.
    List,

    /// Delete a secret.
    Delete {
        /// Secret key.
        key: String,
    },
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the non-secure settings and the stored entries.
    Show,

    /// Change a stored entry.
    Set {
        /// Entry name, optionally prefixed with its scope (`scope.name`).
        name: String,

        /// New value, parsed as JSON when possible.
        value: String,

        /// Change the entry even if it is not editable.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Directory of the local manager.
    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_HOME)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_purge_defaults_to_workflow_events() {
        let cli = Cli::parse_from(["stratus", "events", "purge", "dep"]);
        let Commands::Events {
            command: EventCommands::Purge { event_types, .. },
        } = cli.command
        else {
            panic!("unexpected command");
        };
        assert_eq!(event_types, vec![String::from(WORKFLOW_EVENT_TYPE)]);
    }

    #[test]
    fn test_restore_flags() {
        let cli = Cli::parse_from([
            "stratus",
            "--output",
            "json",
            "snapshots",
            "restore",
            "snap",
            "--ignore-plugin-failure",
        ]);
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::Snapshots {
                command: SnapshotCommands::Restore {
                    ignore_plugin_failure: true,
                    ..
                }
            }
        ));
    }

    #[test]
    fn test_home_override() {
        let cli = Cli::parse_from(["stratus", "--home", "/tmp/mgr", "snapshots", "status"]);
        assert_eq!(cli.home_dir(), PathBuf::from("/tmp/mgr"));
    }
}
