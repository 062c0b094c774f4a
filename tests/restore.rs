//! Snapshot restores against the local manager.

mod common;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use common::Harness;
use stratus_manager::component::archive::build_wagon;
use stratus_manager::error::{ErrorKind, Result};
use stratus_manager::execution::ExecutionStatus;
use stratus_manager::manager::{
    ExecutionsApi, ImportSink, LocalManager, MaintenanceApi, MaintenanceMode, Plugin,
    PluginsApi, SecretCipher, SecretsApi, SnapshotsApi,
};
use stratus_manager::restore::{
    ManagerVersion, PLUGINS, RestoreOptions, RestoreStatus, SECRETS, SnapshotDump,
    SnapshotRestorer, TableData,
};

const BAD_PLUGIN: &str = "plugin-5";

fn plugin_row(id: &str) -> Value {
    json!({
        "id": id,
        "package_name": format!("{id}-package"),
        "package_version": "1.0.0",
        "archive_name": format!("{id}.wgn"),
        "uploaded_at": "2024-01-01T00:00:00Z",
    })
}

/// A current-version snapshot with eight plugins, one of which ships a
/// wagon that is not an archive.
fn snapshot_with_plugins(h: &Harness) -> SnapshotDump {
    let mut dump = SnapshotDump::new("snap", ManagerVersion::CURRENT);
    dump.encryption_key = Some(SecretCipher::generate().key());

    let ids: Vec<String> = (1..=8).map(|i| format!("plugin-{i}")).collect();
    dump.set_table(PLUGINS, ids.iter().map(|id| plugin_row(id)))
        .unwrap();
    for id in &ids {
        let wagon = if id == BAD_PLUGIN {
            b"not a wagon".to_vec()
        } else {
            let path = h.path(&format!("{id}.wgn"));
            build_wagon(&path, &format!("{id}-package"), "1.0.0").unwrap();
            std::fs::read(&path).unwrap()
        };
        dump.plugin_archives.insert(id.clone(), wagon);
    }
    dump
}

async fn upload(h: &Harness, dump: &SnapshotDump) {
    let path = h.path("upload.tar");
    dump.write(&path).unwrap();
    SnapshotsApi::upload(h.manager.as_ref(), &dump.metadata.snapshot_id, &path)
        .await
        .unwrap();
}

fn secret_row(key: &str, value: &str) -> Value {
    json!({
        "key": key,
        "value": value,
        "is_hidden_value": true,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
    })
}

#[tokio::test]
async fn test_status_without_restore_is_not_running() {
    let h = Harness::new().await;
    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();

    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
}

#[tokio::test]
async fn test_restore_skips_failed_plugin_when_ignored() {
    let h = Harness::new().await;
    upload(&h, &snapshot_with_plugins(&h)).await;
    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();

    let options = RestoreOptions {
        ignore_plugin_failure: true,
    };
    let handle = restorer.restore("snap", options).await.unwrap();
    let execution_id = handle.execution.id.clone();
    let report = handle.join().await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Terminated);
    assert_eq!(report.imported.get(PLUGINS), Some(&7));
    assert_eq!(report.failed_plugins.len(), 1);
    assert_eq!(report.failed_plugins[0].plugin_id, BAD_PLUGIN);

    let installed = PluginsApi::list(h.manager.as_ref()).await.unwrap();
    assert_eq!(installed.len(), 7);
    assert!(installed.iter().all(|p| p.id != BAD_PLUGIN));

    let execution = ExecutionsApi::get(h.manager.as_ref(), &execution_id)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert_eq!(
        MaintenanceApi::status(h.manager.as_ref()).await.unwrap(),
        MaintenanceMode::Deactivated
    );
    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
}

#[tokio::test]
async fn test_restore_fails_on_plugin_failure() {
    let h = Harness::new().await;
    upload(&h, &snapshot_with_plugins(&h)).await;
    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();

    let handle = restorer
        .restore("snap", RestoreOptions::default())
        .await
        .unwrap();
    let execution_id = handle.execution.id.clone();
    let err = handle.join().await.unwrap_err();
    assert!(err.to_string().contains(BAD_PLUGIN));

    let execution = ExecutionsApi::get(h.manager.as_ref(), &execution_id)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.contains(BAD_PLUGIN));
    assert_eq!(
        MaintenanceApi::status(h.manager.as_ref()).await.unwrap(),
        MaintenanceMode::Deactivated
    );
    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
}

#[tokio::test]
async fn test_restore_plaintext_secrets_before_encryption() {
    let h = Harness::new().await;
    let mut dump = SnapshotDump::new("old", ManagerVersion::new(4, 3, 0));
    dump.set_table(SECRETS, [secret_row("db_password", "hunter2")])
        .unwrap();
    upload(&h, &dump).await;

    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();
    let report = restorer
        .restore("old", RestoreOptions::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(report.version, Some(ManagerVersion::new(4, 3, 0)));

    let secret = SecretsApi::get(h.manager.as_ref(), "db_password")
        .await
        .unwrap();
    assert_eq!(secret.value, "hunter2");
    assert!(!secret.is_hidden_value);
}

#[tokio::test]
async fn test_restore_encrypted_secrets() {
    let h = Harness::new().await;
    let cipher = SecretCipher::generate();
    let mut dump = SnapshotDump::new("new", ManagerVersion::HIDDEN_SECRETS);
    dump.encryption_key = Some(cipher.key());
    dump.set_table(
        SECRETS,
        [secret_row("db_password", &cipher.encrypt("hunter2").unwrap())],
    )
    .unwrap();
    upload(&h, &dump).await;

    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();
    restorer
        .restore("new", RestoreOptions::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    let secret = SecretsApi::get(h.manager.as_ref(), "db_password")
        .await
        .unwrap();
    assert_eq!(secret.value, "hunter2");
    assert!(secret.is_hidden_value);
}

#[tokio::test]
async fn test_restore_unknown_snapshot() {
    let h = Harness::new().await;
    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();

    let err = restorer
        .restore("missing", RestoreOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
}

#[tokio::test]
async fn test_snapshot_of_local_manager_restores_elsewhere() {
    let source = Harness::new().await;
    SecretsApi::create(
        source.manager.as_ref(),
        "token",
        "s3cr3t",
        stratus_manager::manager::SecretOptions::default(),
    )
    .await
    .unwrap();
    SnapshotsApi::create(source.manager.as_ref(), "full")
        .await
        .unwrap();
    let archive = SnapshotsApi::archive_path(source.manager.as_ref(), "full")
        .await
        .unwrap();

    let target = Harness::new().await;
    SnapshotsApi::upload(target.manager.as_ref(), "full", &archive)
        .await
        .unwrap();
    let restorer = SnapshotRestorer::new(target.clients.clone(), target.config.clone()).unwrap();
    let report = restorer
        .restore("full", RestoreOptions::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.version, Some(ManagerVersion::CURRENT));
    let secret = SecretsApi::get(target.manager.as_ref(), "token")
        .await
        .unwrap();
    assert_eq!(secret.value, "s3cr3t");
}

/// Import sink that holds the first table until released.
struct GatedImport {
    inner: Arc<LocalManager>,
    held: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ImportSink for GatedImport {
    async fn import_table(&self, table: TableData) -> Result<usize> {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        ImportSink::import_table(self.inner.as_ref(), table).await
    }

    async fn install_plugin(&self, plugin: Plugin, wagon: &Path) -> Result<()> {
        ImportSink::install_plugin(self.inner.as_ref(), plugin, wagon).await
    }
}

#[tokio::test]
async fn test_status_while_restore_in_flight() {
    let h = Harness::new().await;
    upload(&h, &SnapshotDump::new("held", ManagerVersion::CURRENT)).await;

    let gate = Arc::new(GatedImport {
        inner: Arc::clone(&h.manager),
        held: AtomicBool::new(false),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let mut clients = h.clients.clone();
    clients.import = gate.clone();
    let restorer = SnapshotRestorer::new(clients, h.config.clone()).unwrap();

    let handle = restorer
        .restore("held", RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(restorer.get_status(), RestoreStatus::Running);

    let err = restorer
        .restore("held", RestoreOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    gate.entered.notified().await;
    assert_eq!(restorer.get_status(), RestoreStatus::Running);
    assert_eq!(
        MaintenanceApi::status(h.manager.as_ref()).await.unwrap(),
        MaintenanceMode::Activated
    );
    let marker = restorer.marker().read().await.unwrap().unwrap();
    assert_eq!(marker.execution_id, handle.execution.id);

    gate.release.notify_one();
    let report = handle.join().await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Terminated);
    assert_eq!(restorer.get_status(), RestoreStatus::NotRunning);
    assert_eq!(
        MaintenanceApi::status(h.manager.as_ref()).await.unwrap(),
        MaintenanceMode::Deactivated
    );
}

#[tokio::test]
async fn test_restore_skips_plugin_escaping_its_directory() {
    let h = Harness::new().await;
    let mut dump = snapshot_with_plugins(&h);
    let mut rows = dump.table(PLUGINS).to_vec();
    rows[0]["archive_name"] = json!("../../state/state.json");
    dump.set_table(PLUGINS, rows).unwrap();
    upload(&h, &dump).await;

    let restorer = SnapshotRestorer::new(h.clients.clone(), h.config.clone()).unwrap();
    let options = RestoreOptions {
        ignore_plugin_failure: true,
    };
    let report = restorer
        .restore("snap", options)
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    let skipped: Vec<&str> = report
        .failed_plugins
        .iter()
        .map(|f| f.plugin_id.as_str())
        .collect();
    assert_eq!(skipped, vec!["plugin-1", BAD_PLUGIN]);
    assert_eq!(report.imported.get(PLUGINS), Some(&6));

    let reopened = LocalManager::open(h.path("manager")).await.unwrap();
    assert_eq!(PluginsApi::list(&reopened).await.unwrap().len(), 6);
}
