//! Configuration file loader.
//!
//! Settings are read from up to three YAML files, each located through an
//! environment variable and carrying its own key namespace.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::settings::ManagerConfig;
use crate::error::{ConfigError, ManagerError, Result};

/// Environment variable and namespace of each configuration file.
pub const CONFIG_FILES: &[(&str, &str)] = &[
    ("STRATUS_CONFIG_PATH", ""),
    ("STRATUS_SECURITY_CONFIG_PATH", "security"),
    ("STRATUS_AUTHORIZATION_CONFIG_PATH", "authorization"),
];

/// Outcome of loading configuration files.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Files that were read.
    pub files: Vec<PathBuf>,
    /// Unknown-key diagnostics, one per ignored key.
    pub diagnostics: Vec<String>,
}

/// Loads configuration files into a [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// (path, namespace) pairs to load, in order.
    sources: Vec<(PathBuf, String)>,
    /// Base path for the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader with no sources.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sources: Vec::new(),
            base_path: None,
        }
    }

    /// Creates a loader from the `STRATUS_*_CONFIG_PATH` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut loader = Self::new();
        for (var, namespace) in CONFIG_FILES {
            if let Ok(path) = std::env::var(var) {
                debug!("{var} points to {path}");
                loader = loader.with_file(path, namespace);
            }
        }
        loader
    }

    /// Adds a file to load with the given key namespace.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, namespace: &str) -> Self {
        self.sources.push((path.into(), namespace.to_string()));
        self
    }

    /// Sets the base path for the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConfigError::parse(
                    format!("Failed to load .env file: {e}"),
                    Some(env_path.display().to_string()),
                )
            })?;
        }
        Ok(())
    }

    /// Applies every configured file to `config`.
    ///
    /// Files that do not exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but is not a YAML mapping.
    pub fn load_into(&self, config: &mut ManagerConfig) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for (path, namespace) in &self.sources {
            if !path.exists() {
                debug!("Configuration file {} does not exist, skipping", path.display());
                continue;
            }
            let values = Self::read_mapping(path)?;
            info!("Loading configuration from: {}", path.display());
            let file = path.display().to_string();
            report
                .diagnostics
                .extend(config.apply_file_values(values, namespace, &file));
            report.files.push(path.clone());
        }

        Ok(report)
    }

    fn read_mapping(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ManagerError::Config(ConfigError::parse(
                format!("Failed to read file: {e}"),
                Some(path.display().to_string()),
            ))
        })?;

        let value: serde_json::Value = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::parse(
                format!("YAML parse error: {e}"),
                Some(path.display().to_string()),
            )
        })?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            serde_json::Value::Null => Ok(serde_json::Map::new()),
            other => Err(ConfigError::parse(
                format!("expected a mapping at the top level, found {other}"),
                Some(path.display().to_string()),
            )
            .into()),
        }
    }
}
