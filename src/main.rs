//! Stratus CLI entrypoint.
//!
//! This is the main entrypoint for the stratus command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use stratus_manager::cli::{
    BlueprintCommands, Cli, Commands, ComponentCommands, ConfigCommands, DeploymentCommands,
    EventCommands, OutputFormatter, SecretCommands, SnapshotCommands,
};
use stratus_manager::component::{
    ArtifactFetcher, ComponentProvisioner, ComponentSpec, HttpFetcher,
};
use stratus_manager::config::{ConfigContext, ConfigLoader, ManagerConfig, Slot};
use stratus_manager::error::{ConfigError, Result};
use stratus_manager::execution::ExecutionPoller;
use stratus_manager::manager::{
    LocalManager, ManagerClients, PurgeRequest, RestClient, SecretOptions,
};
use stratus_manager::restore::{RestoreOptions, SnapshotRestorer};
use stratus_manager::state::{StateStore, generate_holder_id};
use stratus_manager::topology::TopologyParser;
use stratus_manager::update::{DiffEngine, UpdateStateMachine};

use clap::Parser;
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Name of the restore marker inside the local manager directory.
const MARKER_FILE: &str = "snapshot-restore.marker";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` wins; otherwise `RUST_LOG`, then the configured level.
fn init_logging(verbose: bool, json: bool, configured: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("info")))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Everything a command may need.
struct Backend {
    local: Arc<LocalManager>,
    clients: ManagerClients,
    config: ConfigContext,
}

impl Backend {
    /// Opens the local manager, loads configuration and picks the
    /// collaborators.
    async fn open(cli: &Cli) -> Result<(Self, Vec<String>)> {
        let home = cli.home_dir();
        let loader = ConfigLoader::from_env();
        loader.load_dotenv()?;

        let mut config = ManagerConfig::new();
        let report = loader.load_into(&mut config)?;
        if matches!(config.slot("restore_marker_path"), Some(Slot::Unset)) {
            config.set(
                "restore_marker_path",
                Value::String(home.join(MARKER_FILE).display().to_string()),
            )?;
        }

        let local = Arc::new(LocalManager::open(&home).await?);
        config.load(local.as_ref()).await?;

        let clients = match &cli.manager_url {
            Some(url) => {
                let rest = Arc::new(
                    RestClient::new(url, cli.token.clone())?
                        .with_tenant(&cli.tenant)
                        .with_download_dir(home.join("downloads")),
                );
                ManagerClients {
                    blueprints: rest.clone(),
                    deployments: rest.clone(),
                    executions: rest.clone(),
                    secrets: rest.clone(),
                    plugins: rest.clone(),
                    maintenance: rest.clone(),
                    snapshots: rest,
                    updates: local.clone(),
                    runtime: local.clone(),
                    import: local.clone(),
                    events: local.clone(),
                }
            }
            None => ManagerClients::from_backend(local.clone()),
        };

        let backend = Self {
            local,
            clients,
            config: ConfigContext::new(config),
        };
        Ok((backend, report.diagnostics))
    }

    fn fetcher(&self) -> Result<Arc<dyn ArtifactFetcher>> {
        let root = self.config.current().file_server_root()?;
        Ok(Arc::new(HttpFetcher::new(Some(root))?))
    }

    /// Runs `task` while holding the state lock.
    async fn locked<T, F>(&self, purpose: &str, task: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let store = self.local.store();
        let lock = store.acquire_lock(&generate_holder_id(), purpose).await?;
        let outcome = task.await;
        if let Err(e) = store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        outcome
    }
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<()> {
    if let Commands::Diff { old, new } = &cli.command {
        init_logging(cli.verbose, cli.log_json, None);
        return cmd_diff(old, new, formatter);
    }

    let (backend, diagnostics) = Backend::open(&cli).await?;
    let level = backend.config.current().log_level().ok();
    init_logging(cli.verbose, cli.log_json, level.as_deref());
    for diagnostic in &diagnostics {
        warn!("{diagnostic}");
    }
    debug!("Local manager at {}", backend.local.root().display());

    match cli.command {
        Commands::Diff { .. } => Ok(()),
        Commands::Blueprints { command } => cmd_blueprints(&backend, command, formatter).await,
        Commands::Deployments { command } => cmd_deployments(&backend, command, formatter).await,
        Commands::Update {
            deployment_id,
            blueprint_id,
            timeout,
        } => cmd_update(&backend, &deployment_id, &blueprint_id, timeout, formatter).await,
        Commands::Component { command } => cmd_component(&backend, command, formatter).await,
        Commands::Snapshots { command } => cmd_snapshots(&backend, command, formatter).await,
        Commands::Events { command } => cmd_events(&backend, command, formatter).await,
        Commands::Secrets { command } => cmd_secrets(&backend, command, formatter).await,
        Commands::Config { command } => cmd_config(&backend, command, formatter).await,
    }
}

/// Show the steps between two topology files.
fn cmd_diff(old: &Path, new: &Path, formatter: &OutputFormatter) -> Result<()> {
    let parser = TopologyParser::new();
    let old = parser.load_file(old)?;
    let new = parser.load_file(new)?;
    let diff = DiffEngine::new().diff(&old, &new)?;
    info!("{} step(s) between the topologies", diff.steps.len());
    emit(&formatter.format_diff(&diff))
}

async fn cmd_blueprints(
    backend: &Backend,
    command: BlueprintCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let blueprints = &backend.clients.blueprints;
    match command {
        BlueprintCommands::Upload { blueprint_id, path } => {
            let topology = TopologyParser::new().load_file(&path)?;
            let blueprint = blueprints.upload(&blueprint_id, topology).await?;
            emit(&formatter.success(&format!(
                "Blueprint '{}' uploaded ({} nodes)",
                blueprint.id,
                blueprint.topology.nodes.len()
            )))
        }
        BlueprintCommands::List => {
            let list = blueprints.list().await?;
            emit(&formatter.format_blueprints(&list))
        }
    }
}

async fn cmd_deployments(
    backend: &Backend,
    command: DeploymentCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let deployments = &backend.clients.deployments;
    match command {
        DeploymentCommands::Create {
            deployment_id,
            blueprint_id,
            inputs,
        } => {
            let inputs = match inputs {
                Some(path) => read_document(&path)?,
                None => Value::Object(serde_json::Map::new()),
            };
            let deployment = deployments
                .create(&deployment_id, &blueprint_id, inputs)
                .await?;
            emit(&formatter.success(&format!(
                "Deployment '{}' created from blueprint '{}'",
                deployment.id, deployment.blueprint_id
            )))
        }
        DeploymentCommands::Delete { deployment_id } => {
            deployments.delete(&deployment_id).await?;
            emit(&formatter.success(&format!("Deployment '{deployment_id}' deleted")))
        }
        DeploymentCommands::List => {
            let list = deployments.list().await?;
            emit(&formatter.format_deployments(&list))
        }
    }
}

async fn cmd_update(
    backend: &Backend,
    deployment_id: &str,
    blueprint_id: &str,
    timeout: u64,
    formatter: &OutputFormatter,
) -> Result<()> {
    let machine =
        UpdateStateMachine::new(backend.clients.clone(), backend.fetcher()?, &backend.config)?;
    let update = backend
        .locked(
            "update",
            machine.run(deployment_id, blueprint_id, Duration::from_secs(timeout)),
        )
        .await?;
    emit(&formatter.format_update(&update))
}

async fn cmd_component(
    backend: &Backend,
    command: ComponentCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config = backend.config.current();
    let provisioner = ComponentProvisioner::new(
        backend.clients.clone(),
        backend.fetcher()?,
        ExecutionPoller::new(config.poll_interval()?),
    );

    match command {
        ComponentCommands::Create {
            owner,
            properties,
            timeout,
        } => {
            let properties: BTreeMap<String, Value> =
                serde_json::from_value(read_document(&properties)?).map_err(|e| {
                    ConfigError::parse(format!("properties must be a mapping: {e}"), None)
                })?;
            let spec = ComponentSpec::from_properties(&properties, &owner)?;
            let timeout = match timeout.map(Duration::from_secs).or(spec.timeout) {
                Some(timeout) => timeout,
                None => config.component_timeout()?,
            };
            let created = provisioner.create(&owner, &spec, timeout).await?;
            let message = if created {
                format!("Component '{}' created", spec.deployment.id)
            } else {
                format!("Component '{}' already exists", spec.deployment.id)
            };
            emit(&formatter.success(&message))
        }
        ComponentCommands::Delete {
            owner,
            deployment_id,
            timeout,
        } => {
            let timeout = match timeout {
                Some(secs) => Duration::from_secs(secs),
                None => config.component_timeout()?,
            };
            provisioner.delete(&owner, &deployment_id, timeout).await?;
            emit(&formatter.success(&format!("Component '{deployment_id}' deleted")))
        }
    }
}

async fn cmd_snapshots(
    backend: &Backend,
    command: SnapshotCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let snapshots = &backend.clients.snapshots;
    match command {
        SnapshotCommands::Create { snapshot_id } => {
            let snapshot = snapshots.create(&snapshot_id).await?;
            emit(&formatter.success(&format!("Snapshot '{}' {}", snapshot.id, snapshot.status)))
        }
        SnapshotCommands::Upload { snapshot_id, path } => {
            let snapshot = snapshots.upload(&snapshot_id, &path).await?;
            emit(&formatter.success(&format!("Snapshot '{}' {}", snapshot.id, snapshot.status)))
        }
        SnapshotCommands::List => {
            let list = snapshots.list().await?;
            emit(&formatter.format_snapshots(&list))
        }
        SnapshotCommands::Status => {
            let restorer = SnapshotRestorer::new(backend.clients.clone(), backend.config.clone())?;
            emit(&formatter.format_restore_status(restorer.get_status()))
        }
        SnapshotCommands::Restore {
            snapshot_id,
            ignore_plugin_failure,
        } => {
            let restorer = SnapshotRestorer::new(backend.clients.clone(), backend.config.clone())?;
            let options = RestoreOptions {
                ignore_plugin_failure,
            };
            let report = backend
                .locked("restore", async {
                    let handle = restorer.restore(&snapshot_id, options).await?;
                    info!("Restore execution {} started", handle.execution.id);
                    handle.join().await
                })
                .await?;
            emit(&formatter.format_restore(&report))
        }
    }
}

async fn cmd_events(
    backend: &Backend,
    command: EventCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    match command {
        EventCommands::Purge {
            deployment_id,
            event_types,
            include_logs,
            store_before,
        } => {
            let outcome = backend
                .clients
                .events
                .purge(PurgeRequest {
                    deployment_id,
                    event_types,
                    include_logs,
                    store_before,
                    actor: actor(),
                })
                .await?;
            emit(&formatter.format_purge(&outcome))
        }
    }
}

async fn cmd_secrets(
    backend: &Backend,
    command: SecretCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let secrets = &backend.clients.secrets;
    match command {
        SecretCommands::Create {
            key,
            value,
            update_if_exists,
            hidden,
        } => {
            let options = SecretOptions {
                update_if_exists,
                is_hidden_value: hidden,
                ..SecretOptions::default()
            };
            let secret = secrets.create(&key, &value, options).await?;
            emit(&formatter.success(&format!("Secret '{}' stored", secret.key)))
        }
        SecretCommands::Get { key } => {
            let secret = secrets.get(&key).await?;
            emit(&formatter.format_secret(&secret))
        }
        SecretCommands::List => {
            let keys = secrets.list().await?;
            emit(&formatter.format_names(&keys))
        }
        SecretCommands::Delete { key } => {
            secrets.delete(&key).await?;
            emit(&formatter.success(&format!("Secret '{key}' deleted")))
        }
    }
}

async fn cmd_config(
    backend: &Backend,
    command: ConfigCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let settings = backend.config.current().public_view();
            let store = backend.local.config_store().await;
            emit(&formatter.format_config(&settings, store.entries()))
        }
        ConfigCommands::Set { name, value, force } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let changed = backend
                .local
                .update_config(vec![(name, value)], &actor(), force)
                .await?;
            for entry in &changed {
                emit(&formatter.success(&format!(
                    "{}.{} = {}",
                    entry.scope, entry.name, entry.value
                )))?;
            }
            Ok(())
        }
    }
}

/// Reads a YAML or JSON document.
fn read_document(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| {
        ConfigError::parse(
            format!("Failed to parse document: {e}"),
            Some(path.display().to_string()),
        )
        .into()
    })
}

/// Name recorded as the author of audited changes.
fn actor() -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("stratus"))
    })
}
