//! Configuration module for the Stratus manager.
//!
//! This module handles all configuration-related functionality:
//! - The settings registry with lazily-loaded, store-backed values
//! - Loading namespaced YAML configuration files
//! - Persisted config entries with editability and schema checks
//! - The explicit configuration context passed to orchestrators

mod context;
mod parser;
mod settings;
mod store;

pub use context::ConfigContext;
pub use parser::{ConfigLoader, LoadReport, CONFIG_FILES};
pub use settings::{ManagerConfig, SettingDef, Slot, SETTINGS};
pub use store::{validate_schema, ConfigEntry, ConfigStore, SettingsSource, REST_SCOPE};
