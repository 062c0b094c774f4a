//! Snapshot restore orchestrator.
//!
//! A restore runs as a `restore_snapshot` execution. The orchestrator
//! validates the snapshot, starts the execution, then imports the snapshot
//! in the background while the manager is in maintenance mode and the
//! restore marker exists. Tables are imported whole; plugins are installed
//! one by one and a failing plugin can be skipped.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dump::SnapshotDump;
use super::marker::{MarkerInfo, RestoreMarker, RestoreStatus};
use super::migrate::{Migrator, record_id};
use super::tables::{
    AGENTS, BLUEPRINTS, DEPENDENCIES, DEPLOYMENTS, EVENTS, EXECUTIONS, NODE_INSTANCES, PLUGINS,
    SECRETS, TENANTS, TableData,
};
use super::version::ManagerVersion;
use crate::config::ConfigContext;
use crate::error::{ManagerError, RestoreError, Result};
use crate::execution::{ExecutionPoller, ExecutionStatus};
use crate::manager::{Execution, ManagerClients, RESTORE_WORKFLOW, StartExecution};
use crate::state::generate_holder_id;

/// Options of a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Skip plugins that fail to install instead of failing the restore.
    pub ignore_plugin_failure: bool,
}

/// A plugin that could not be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginFailure {
    /// Plugin id.
    pub plugin_id: String,
    /// Cause.
    pub reason: String,
}

/// Outcome of a restore run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Restored snapshot.
    pub snapshot_id: String,
    /// Restore execution.
    pub execution_id: String,
    /// Version that produced the snapshot.
    pub version: Option<ManagerVersion>,
    /// Imported record count per table.
    pub imported: BTreeMap<String, usize>,
    /// Plugins skipped because they failed to install.
    pub failed_plugins: Vec<PluginFailure>,
    /// Final status of the restore execution.
    pub status: ExecutionStatus,
}

impl RestoreReport {
    fn new(snapshot_id: &str, execution_id: &str) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            execution_id: execution_id.to_string(),
            version: None,
            imported: BTreeMap::new(),
            failed_plugins: Vec::new(),
            status: ExecutionStatus::Started,
        }
    }
}

/// A restore running in the background.
#[derive(Debug)]
pub struct RestoreHandle {
    /// The restore execution, as started.
    pub execution: Execution,
    task: JoinHandle<Result<RestoreReport>>,
}

impl RestoreHandle {
    /// Waits for the background run to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the run.
    pub async fn join(self) -> Result<RestoreReport> {
        self.task
            .await
            .map_err(|e| ManagerError::internal(format!("restore task failed: {e}")))?
    }
}

/// Restores snapshots into the manager.
#[derive(Debug, Clone)]
pub struct SnapshotRestorer {
    clients: ManagerClients,
    config: ConfigContext,
    marker: RestoreMarker,
    poller: ExecutionPoller,
}

impl SnapshotRestorer {
    /// Creates a restorer using the configured marker path and poll
    /// interval. Status polling tolerates transient errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read.
    pub fn new(clients: ManagerClients, config: ConfigContext) -> Result<Self> {
        let current = config.current();
        let marker = RestoreMarker::new(current.restore_marker_path()?);
        let poller = ExecutionPoller::tolerant(current.poll_interval()?);
        Ok(Self {
            clients,
            config,
            marker,
            poller,
        })
    }

    /// Marker used by this restorer.
    #[must_use]
    pub const fn marker(&self) -> &RestoreMarker {
        &self.marker
    }

    /// Whether a restore is running, from the marker file alone.
    #[must_use]
    pub fn get_status(&self) -> RestoreStatus {
        self.marker.status()
    }

    /// Starts restoring `snapshot_id`.
    ///
    /// Validation happens before the execution is created; the import runs
    /// in a background task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown snapshot, `NotRestorable` if it is
    /// not created or uploaded, and `AlreadyRunning` if a restore is in
    /// flight.
    pub async fn restore(
        &self,
        snapshot_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreHandle> {
        let snapshot = self.clients.snapshots.get(snapshot_id).await?;
        if !snapshot.status.is_restorable() {
            return Err(RestoreError::NotRestorable {
                snapshot_id: snapshot_id.to_string(),
                status: snapshot.status.to_string(),
            }
            .into());
        }

        // The marker is claimed before the execution exists so a second
        // restore is refused from here on.
        let mut marker = MarkerInfo {
            holder: generate_holder_id(),
            execution_id: String::new(),
            snapshot_id: snapshot_id.to_string(),
            started_at: Utc::now(),
        };
        self.marker.begin(&marker).await?;

        let started = self
            .clients
            .executions
            .start(StartExecution {
                deployment_id: None,
                workflow_id: String::from(RESTORE_WORKFLOW),
                parameters: json!({
                    "snapshot_id": snapshot_id,
                    "ignore_plugin_failure": options.ignore_plugin_failure,
                }),
                with_token: true,
                bypass_maintenance: true,
            })
            .await;
        let execution = match started {
            Ok(execution) => execution,
            Err(e) => {
                if let Err(clear) = self.marker.clear().await {
                    error!("Failed to remove restore marker: {clear}");
                }
                return Err(e);
            }
        };
        marker.execution_id = execution.id.clone();
        if let Err(e) = self.marker.update(&marker).await {
            warn!("Could not record execution {} in restore marker: {e}", execution.id);
        }
        info!(
            "Restoring snapshot {snapshot_id} (execution {})",
            execution.id
        );

        let this = self.clone();
        let snapshot_id = snapshot_id.to_string();
        let execution_id = execution.id.clone();
        let task =
            tokio::spawn(async move { this.run(&snapshot_id, &execution_id, options).await });

        Ok(RestoreHandle { execution, task })
    }

    /// Waits for a restore execution to finish.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the execution is still running at the deadline.
    pub async fn wait(&self, execution_id: &str, timeout: Duration) -> Result<Execution> {
        self.poller
            .wait_for_execution(self.clients.executions.as_ref(), execution_id, timeout)
            .await?
            .ok_or_else(|| {
                RestoreError::Timeout {
                    execution_id: execution_id.to_string(),
                    timeout,
                }
                .into()
            })
    }

    /// Starts a restore and waits for it with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns validation errors of [`Self::restore`] or a timeout.
    pub async fn restore_and_wait(
        &self,
        snapshot_id: &str,
        options: RestoreOptions,
    ) -> Result<Execution> {
        let timeout = self.config.current().restore_timeout()?;
        let handle = self.restore(snapshot_id, options).await?;
        self.wait(&handle.execution.id, timeout).await
    }

    async fn run(
        &self,
        snapshot_id: &str,
        execution_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let mut report = RestoreReport::new(snapshot_id, execution_id);
        let outcome = self.activate_and_import(&mut report, options).await;

        if let Err(e) = self.clients.maintenance.deactivate().await {
            error!("Failed to leave maintenance mode after restore: {e}");
        }
        if let Err(e) = self.marker.clear().await {
            error!("Failed to remove restore marker: {e}");
        }

        match outcome {
            Ok(()) => {
                report.status = self.finish(execution_id, Ok(())).await;
                info!(
                    "Restore of snapshot {snapshot_id} finished: {} plugin(s) skipped",
                    report.failed_plugins.len()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Restore of snapshot {snapshot_id} failed: {e}");
                self.finish(execution_id, Err(&e)).await;
                Err(e)
            }
        }
    }

    async fn activate_and_import(
        &self,
        report: &mut RestoreReport,
        options: RestoreOptions,
    ) -> Result<()> {
        self.clients
            .executions
            .set_status(&report.execution_id, ExecutionStatus::Started, String::new())
            .await?;
        self.clients.maintenance.activate().await?;
        debug!("Maintenance mode activated for restore");
        self.import(report, options).await
    }

    async fn finish(
        &self,
        execution_id: &str,
        outcome: std::result::Result<(), &ManagerError>,
    ) -> ExecutionStatus {
        let (status, message) = match outcome {
            Ok(()) => (ExecutionStatus::Terminated, String::new()),
            Err(e) => (ExecutionStatus::Failed, e.to_string()),
        };
        if let Err(e) = self
            .clients
            .executions
            .set_status(execution_id, status, message)
            .await
        {
            error!("Failed to set restore execution {execution_id} to {status}: {e}");
        }
        status
    }

    async fn import(&self, report: &mut RestoreReport, options: RestoreOptions) -> Result<()> {
        let archive = self.clients.snapshots.archive_path(&report.snapshot_id).await?;
        let dump = tokio::task::spawn_blocking(move || SnapshotDump::read(&archive))
            .await
            .map_err(|e| ManagerError::internal(format!("snapshot reader failed: {e}")))??;

        let migrator = Migrator::for_dump(&dump)?;
        report.version = Some(migrator.version());
        info!(
            "Importing snapshot {} produced by version {}",
            report.snapshot_id,
            migrator.version()
        );

        self.import_table(report, migrator.tenants(dump.table(TENANTS))?).await?;
        self.import_table(report, migrator.blueprints(dump.table(BLUEPRINTS))?).await?;
        self.import_table(report, migrator.deployments(dump.table(DEPLOYMENTS))?).await?;
        self.import_table(report, migrator.node_instances(dump.table(NODE_INSTANCES))?)
            .await?;
        self.import_table(report, migrator.secrets(dump.table(SECRETS))?).await?;
        self.install_plugins(report, &dump, &migrator, options).await?;
        self.import_table(report, migrator.executions(dump.table(EXECUTIONS))?).await?;
        self.import_table(report, migrator.events(dump.table(EVENTS))?).await?;
        self.import_table(report, migrator.agents(dump.table(AGENTS))?).await?;
        self.import_table(report, migrator.dependencies(dump.table(DEPENDENCIES))?)
            .await?;
        Ok(())
    }

    async fn import_table(&self, report: &mut RestoreReport, table: TableData) -> Result<()> {
        let name = table.name();
        let count = self
            .clients
            .import
            .import_table(table)
            .await
            .map_err(|e| RestoreError::ImportFailed {
                table: name,
                message: e.to_string(),
            })?;
        info!("Imported {count} record(s) into {name}");
        report.imported.insert(name.to_string(), count);
        Ok(())
    }

    async fn install_plugins(
        &self,
        report: &mut RestoreReport,
        dump: &SnapshotDump,
        migrator: &Migrator,
        options: RestoreOptions,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let mut installed = 0;

        for row in dump.table(PLUGINS) {
            let plugin_id = record_id(row);
            match self.install_plugin(dump, migrator, row, staging.path()).await {
                Ok(()) => installed += 1,
                Err(e) if options.ignore_plugin_failure => {
                    warn!("Skipping plugin {plugin_id}: {e}");
                    report.failed_plugins.push(PluginFailure {
                        plugin_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    return Err(RestoreError::PluginInstallFailed {
                        plugin_id,
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }

        info!("Installed {installed} plugin(s)");
        report.imported.insert(String::from(PLUGINS), installed);
        Ok(())
    }

    async fn install_plugin(
        &self,
        dump: &SnapshotDump,
        migrator: &Migrator,
        row: &serde_json::Value,
        staging: &std::path::Path,
    ) -> Result<()> {
        let plugin = migrator.plugin(row)?;
        let wagon = dump
            .plugin_archives
            .get(&plugin.id)
            .ok_or_else(|| RestoreError::archive(format!("no wagon for plugin {}", plugin.id)))?;

        let path = staging.join(format!("{}.wgn", plugin.id));
        tokio::fs::write(&path, wagon).await?;
        let result = self.clients.import.install_plugin(plugin, &path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove staged wagon {}: {e}", path.display());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::{
        MockBlueprintsApi, MockDeploymentUpdatesApi, MockDeploymentsApi, MockEventsApi,
        MockExecutionsApi, MockImportSink, MockMaintenanceApi, MockPluginsApi, MockRuntimeStore,
        MockSecretsApi, MockSnapshotsApi, Snapshot, SnapshotStatus,
    };
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn restorer(
        snapshots: MockSnapshotsApi,
        executions: MockExecutionsApi,
        marker: &std::path::Path,
    ) -> SnapshotRestorer {
        let clients = ManagerClients {
            blueprints: Arc::new(MockBlueprintsApi::new()),
            deployments: Arc::new(MockDeploymentsApi::new()),
            executions: Arc::new(executions),
            secrets: Arc::new(MockSecretsApi::new()),
            plugins: Arc::new(MockPluginsApi::new()),
            maintenance: Arc::new(MockMaintenanceApi::new()),
            snapshots: Arc::new(snapshots),
            updates: Arc::new(MockDeploymentUpdatesApi::new()),
            runtime: Arc::new(MockRuntimeStore::new()),
            import: Arc::new(MockImportSink::new()),
            events: Arc::new(MockEventsApi::new()),
        };
        let mut config = ManagerConfig::new();
        config
            .set("restore_marker_path", json!(marker.to_string_lossy()))
            .unwrap();
        SnapshotRestorer::new(clients, ConfigContext::new(config)).unwrap()
    }

    fn snapshot(status: SnapshotStatus) -> Snapshot {
        Snapshot {
            id: String::from("snap"),
            status,
            created_at: Utc::now(),
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn test_rejects_snapshot_not_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshots = MockSnapshotsApi::new();
        snapshots
            .expect_get()
            .returning(|_| Ok(snapshot(SnapshotStatus::Creating)));
        let mut executions = MockExecutionsApi::new();
        executions.expect_start().never();

        let restorer = restorer(snapshots, executions, &dir.path().join("marker"));
        let err = restorer
            .restore("snap", RestoreOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("creating"));
    }

    #[tokio::test]
    async fn test_rejects_concurrent_restore() {
        let dir = tempfile::tempdir().unwrap();
        let marker_path = dir.path().join("marker");
        std::fs::write(&marker_path, "{}").unwrap();

        let mut snapshots = MockSnapshotsApi::new();
        snapshots
            .expect_get()
            .returning(|_| Ok(snapshot(SnapshotStatus::Uploaded)));
        let mut executions = MockExecutionsApi::new();
        executions.expect_start().never();

        let restorer = restorer(snapshots, executions, &marker_path);
        assert_eq!(restorer.get_status(), RestoreStatus::Running);
        let err = restorer
            .restore("snap", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Restore(RestoreError::AlreadyRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_start_releases_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker_path = dir.path().join("marker");
        let mut snapshots = MockSnapshotsApi::new();
        snapshots
            .expect_get()
            .returning(|_| Ok(snapshot(SnapshotStatus::Uploaded)));
        let mut executions = MockExecutionsApi::new();
        executions
            .expect_start()
            .times(1)
            .returning(|_| Err(ManagerError::internal("boom")));

        let restorer = restorer(snapshots, executions, &marker_path);
        let err = restorer
            .restore("snap", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
        assert!(!marker_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut executions = MockExecutionsApi::new();
        executions.expect_get().returning(|id| {
            Ok(Execution {
                id: id.to_string(),
                tenant: String::from("default_tenant"),
                deployment_id: None,
                blueprint_id: None,
                workflow_id: String::from(RESTORE_WORKFLOW),
                status: ExecutionStatus::Started,
                parameters: json!({}),
                error: String::new(),
                token: None,
                created_at: Utc::now(),
                scheduled_for: None,
                ended_at: None,
            })
        });

        let restorer = restorer(MockSnapshotsApi::new(), executions, &dir.path().join("marker"));
        let err = restorer
            .wait("exec", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("Execution timed out"));
    }
}
