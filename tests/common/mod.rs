//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use stratus_manager::config::{ConfigContext, ManagerConfig};
use stratus_manager::manager::{LocalManager, ManagerClients};

/// A local manager in a temporary directory, with the clients serving it.
pub struct Harness {
    pub manager: Arc<LocalManager>,
    pub clients: ManagerClients,
    pub config: ConfigContext,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(LocalManager::open(dir.path().join("manager")).await.unwrap());
        let clients = ManagerClients::from_backend(Arc::clone(&manager));

        let mut config = ManagerConfig::new();
        config
            .set(
                "restore_marker_path",
                json!(dir.path().join("snapshot-restore.marker").to_string_lossy()),
            )
            .unwrap();
        config.set("execution_poll_interval_secs", json!(0)).unwrap();

        Self {
            manager,
            clients,
            config: ConfigContext::new(config),
            dir,
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

/// Reads a topology from inline YAML.
pub fn topology(yaml: &str) -> stratus_manager::Topology {
    stratus_manager::TopologyParser::new()
        .parse_yaml(yaml, None::<&Path>)
        .unwrap()
}
