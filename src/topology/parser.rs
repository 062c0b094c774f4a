//! Blueprint topology parsing.

use std::path::Path;
use tracing::{debug, info};

use super::types::Topology;
use crate::error::{ConfigError, ManagerError, Result};

/// Parser for topology documents (YAML or JSON).
#[derive(Debug, Default)]
pub struct TopologyParser;

impl TopologyParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads a topology from a file. JSON is selected by the `.json`
    /// extension, anything else is read as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Topology> {
        let path = path.as_ref();
        info!("Loading topology from: {}", path.display());

        if !path.exists() {
            return Err(ManagerError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::parse(
                format!("Failed to read file: {e}"),
                Some(path.display().to_string()),
            )
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a YAML topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Topology> {
        debug!("Parsing YAML topology");
        let topology: Topology = serde_yaml::from_str(content).map_err(|e| {
            ConfigError::parse(
                format!("YAML parse error: {e}"),
                source.map(|p| p.display().to_string()),
            )
        })?;
        debug!("Parsed topology with {} nodes", topology.nodes.len());
        Ok(topology)
    }

    /// Parses a JSON topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<Topology> {
        debug!("Parsing JSON topology");
        serde_json::from_str(content).map_err(|e| {
            ConfigError::parse(
                format!("JSON parse error: {e}"),
                source.map(|p| p.display().to_string()),
            )
            .into()
        })
    }
}
