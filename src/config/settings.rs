//! Lazily-loaded settings registry.
//!
//! Every setting the manager knows about is declared once in [`SETTINGS`].
//! A setting either comes from a configuration file (or its default), or is
//! store-backed: its value lives in the persisted config entries and is only
//! available after [`ManagerConfig::load`] ran against a [`SettingsSource`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::store::{SettingsSource, REST_SCOPE};
use crate::error::{ConfigError, Result};

/// Definition of a single setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingDef {
    /// Setting name, including its namespace prefix.
    pub name: &'static str,
    /// Default value, as JSON text.
    pub default: &'static str,
    /// Whether the value is loaded from the persisted config entries.
    pub from_store: bool,
    /// Whether the value must be hidden from the public view.
    pub secure: bool,
}

const fn setting(name: &'static str, default: &'static str) -> SettingDef {
    SettingDef {
        name,
        default,
        from_store: false,
        secure: false,
    }
}

const fn stored(name: &'static str, default: &'static str) -> SettingDef {
    SettingDef {
        name,
        default,
        from_store: true,
        secure: false,
    }
}

const fn secure(name: &'static str, default: &'static str) -> SettingDef {
    SettingDef {
        name,
        default,
        from_store: false,
        secure: true,
    }
}

/// All known settings.
pub const SETTINGS: &[SettingDef] = &[
    setting("postgresql_host", "\"localhost\""),
    setting("postgresql_db_name", "\"stratus_db\""),
    setting("postgresql_username", "\"stratus\""),
    secure("postgresql_password", "\"\""),
    setting("postgresql_connection_options", "{}"),
    setting("postgresql_ssl_enabled", "false"),
    setting("postgresql_ssl_client_verification", "false"),
    setting("postgresql_ssl_cert_path", "\"\""),
    setting("postgresql_ssl_key_path", "\"\""),
    setting("ca_cert_path", "\"\""),
    setting("file_server_root", "\"/opt/manager/resources\""),
    setting("state_dir", "\"/opt/manager/state\""),
    setting("restore_marker_path", "\"/opt/manager/snapshot-restore.marker\""),
    setting("execution_poll_interval_secs", "1"),
    setting("restore_timeout_secs", "3600"),
    setting("component_timeout_secs", "1800"),
    setting("update_workflow", "\"update\""),
    stored("rest_service_log_level", "\"INFO\""),
    stored("blueprint_folder_max_size_mb", "50"),
    stored("default_page_size", "1000"),
    SettingDef {
        name: "failed_logins_before_account_lock",
        default: "4",
        from_store: true,
        secure: true,
    },
    SettingDef {
        name: "account_lock_period",
        default: "-1",
        from_store: true,
        secure: true,
    },
    secure("security_secret_key", "\"\""),
    secure("security_hash_salt", "\"\""),
    secure("security_encryption_key", "\"\""),
    secure("authorization_roles", "[]"),
    secure("authorization_permissions", "{}"),
    secure("diagnostics_enabled", "false"),
];

/// State of one setting slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Never set; reads return the default.
    Unset,
    /// Store-backed and not loaded yet.
    Deferred,
    /// Holds a concrete value.
    Loaded(Value),
}

/// The manager configuration: a settings registry with tri-state slots.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    slots: BTreeMap<&'static str, Slot>,
    can_load_from_store: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConfig {
    /// Creates a configuration where every store-backed setting is deferred.
    #[must_use]
    pub fn new() -> Self {
        let slots = SETTINGS
            .iter()
            .map(|def| {
                let slot = if def.from_store {
                    Slot::Deferred
                } else {
                    Slot::Unset
                };
                (def.name, slot)
            })
            .collect();

        Self {
            slots,
            can_load_from_store: true,
        }
    }

    fn definition(name: &str) -> Option<&'static SettingDef> {
        SETTINGS.iter().find(|def| def.name == name)
    }

    /// Returns true while store-backed settings may still be loaded.
    #[must_use]
    pub const fn can_load_from_store(&self) -> bool {
        self.can_load_from_store
    }

    /// Returns the slot for a setting.
    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    /// Sets a setting explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting is not in the registry.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let def = Self::definition(name).ok_or_else(|| ConfigError::UnknownSetting {
            name: name.to_string(),
        })?;
        self.slots.insert(def.name, Slot::Loaded(value));
        Ok(())
    }

    /// Applies values read from a configuration file.
    ///
    /// Keys are prefixed with `namespace` before lookup. Unknown keys are
    /// returned as diagnostics and otherwise ignored.
    pub fn apply_file_values(
        &mut self,
        values: Map<String, Value>,
        namespace: &str,
        file: &str,
    ) -> Vec<String> {
        let mut diagnostics = Vec::new();

        for (key, value) in values {
            let name = if namespace.is_empty() {
                key.clone()
            } else {
                format!("{namespace}_{key}")
            };

            match Self::definition(&name) {
                Some(def) => {
                    debug!("Setting {} from {}", def.name, file);
                    self.slots.insert(def.name, Slot::Loaded(value));
                }
                None => {
                    let message = format!("Ignoring unknown key '{key}' in configuration file '{file}'");
                    warn!("{message}");
                    diagnostics.push(message);
                }
            }
        }

        diagnostics
    }

    /// Loads all store-backed settings from the `rest` scope of `source`.
    ///
    /// Deferred settings with no persisted entry fall back to their default.
    /// Implicit loading is disabled afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    pub async fn load(&mut self, source: &dyn SettingsSource) -> Result<()> {
        let entries = source.config_entries(REST_SCOPE).await?;

        for def in SETTINGS.iter().filter(|def| def.from_store) {
            if let Some(entry) = entries.iter().find(|e| e.name == def.name) {
                self.slots.insert(def.name, Slot::Loaded(entry.value.clone()));
            } else if matches!(self.slots.get(def.name), Some(Slot::Deferred)) {
                self.slots.insert(def.name, Slot::Unset);
            }
        }

        self.can_load_from_store = false;
        debug!("Loaded {} config entries from store", entries.len());
        Ok(())
    }

    /// Returns the value of a setting.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` for a deferred setting while loading is still
    /// allowed, or `UnknownSetting` for names outside the registry.
    pub fn get(&self, name: &str) -> Result<Value> {
        let def = Self::definition(name).ok_or_else(|| ConfigError::UnknownSetting {
            name: name.to_string(),
        })?;

        match self.slots.get(def.name) {
            Some(Slot::Loaded(value)) => Ok(value.clone()),
            Some(Slot::Deferred) if self.can_load_from_store => Err(ConfigError::NotLoaded {
                name: name.to_string(),
            }
            .into()),
            _ => default_value(def),
        }
    }

    /// Forgets the cached value of a setting.
    ///
    /// A store-backed setting becomes deferred again and re-enables loading.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting is not in the registry.
    pub fn invalidate(&mut self, name: &str) -> Result<()> {
        let def = Self::definition(name).ok_or_else(|| ConfigError::UnknownSetting {
            name: name.to_string(),
        })?;

        if def.from_store {
            self.slots.insert(def.name, Slot::Deferred);
            self.can_load_from_store = true;
        } else {
            self.slots.insert(def.name, Slot::Unset);
        }
        Ok(())
    }

    /// Returns every non-secure setting that currently has a value.
    #[must_use]
    pub fn public_view(&self) -> BTreeMap<String, Value> {
        SETTINGS
            .iter()
            .filter(|def| !def.secure)
            .filter_map(|def| self.get(def.name).ok().map(|v| (def.name.to_string(), v)))
            .collect()
    }

    fn get_str(&self, name: &str) -> Result<String> {
        match self.get(name)? {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }

    fn get_u64(&self, name: &str) -> Result<u64> {
        let value = self.get(name)?;
        value.as_u64().ok_or_else(|| {
            ConfigError::parse(format!("{name} must be a non-negative integer, got {value}"), None)
                .into()
        })
    }

    fn get_bool(&self, name: &str) -> Result<bool> {
        let value = self.get(name)?;
        value.as_bool().ok_or_else(|| {
            ConfigError::parse(format!("{name} must be a boolean, got {value}"), None).into()
        })
    }

    /// Composes the PostgreSQL connection URL.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection setting has the wrong type.
    pub fn database_url(&self) -> Result<String> {
        let host = self.get_str("postgresql_host")?;
        let db = self.get_str("postgresql_db_name")?;
        let user = self.get_str("postgresql_username")?;
        let password = self.get_str("postgresql_password")?;

        let mut params: Vec<(String, String)> = match self.get("postgresql_connection_options")? {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                    (k, v)
                })
                .collect(),
            _ => Vec::new(),
        };

        if self.get_bool("postgresql_ssl_enabled")? {
            let ca = self.get_str("ca_cert_path")?;
            if self.get_bool("postgresql_ssl_client_verification")? {
                params.push((String::from("sslmode"), String::from("verify-full")));
                params.push((String::from("sslcert"), self.get_str("postgresql_ssl_cert_path")?));
                params.push((String::from("sslkey"), self.get_str("postgresql_ssl_key_path")?));
            } else {
                params.push((String::from("sslmode"), String::from("verify-ca")));
            }
            params.push((String::from("sslrootcert"), ca));
        }

        let credentials = if password.is_empty() {
            user
        } else {
            format!("{user}:{password}")
        };

        let mut url = format!("postgresql://{credentials}@{host}/{db}");
        if !params.is_empty() {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        Ok(url)
    }

    /// Interval between execution status checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting is not an integer.
    pub fn poll_interval(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.get_u64("execution_poll_interval_secs")?))
    }

    /// Deadline for a snapshot restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting is not an integer.
    pub fn restore_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.get_u64("restore_timeout_secs")?))
    }

    /// Deadline for nested deployment create/delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting is not an integer.
    pub fn component_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.get_u64("component_timeout_secs")?))
    }

    /// Name of the workflow dispatched by deployment updates.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be read.
    pub fn update_workflow(&self) -> Result<String> {
        self.get_str("update_workflow")
    }

    /// Path of the restore marker file.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be read.
    pub fn restore_marker_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.get_str("restore_marker_path")?))
    }

    /// Directory holding the local state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be read.
    pub fn state_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.get_str("state_dir")?))
    }

    /// Root directory for stored resources (event dumps, archives).
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be read.
    pub fn file_server_root(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.get_str("file_server_root")?))
    }

    /// Log level of the REST service, lowercased for `EnvFilter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting has not been loaded.
    pub fn log_level(&self) -> Result<String> {
        Ok(self.get_str("rest_service_log_level")?.to_lowercase())
    }
}

fn default_value(def: &SettingDef) -> Result<Value> {
    serde_json::from_str(def.default).map_err(|e| {
        ConfigError::parse(format!("Invalid default for {}: {e}", def.name), None).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::{ConfigEntry, ConfigStore};
    use serde_json::json;

    #[test]
    fn test_defaults_parse() {
        for def in SETTINGS {
            assert!(default_value(def).is_ok(), "bad default for {}", def.name);
        }
    }

    #[test]
    fn test_deferred_until_loaded() {
        let config = ManagerConfig::new();
        let err = config.get("rest_service_log_level").unwrap_err();
        assert!(err.to_string().contains("has not been loaded"));
        assert_eq!(config.get("postgresql_host").unwrap(), json!("localhost"));
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let mut store = ConfigStore::default();
        store.insert(ConfigEntry::new("rest_service_log_level", REST_SCOPE, json!("DEBUG")));

        let mut config = ManagerConfig::new();
        config.load(&store).await.unwrap();

        assert!(!config.can_load_from_store());
        assert_eq!(config.log_level().unwrap(), "debug");
        // missing entries fall back to the default
        assert_eq!(config.get("default_page_size").unwrap(), json!(1000));
    }

    #[tokio::test]
    async fn test_invalidate_defers_again() {
        let store = ConfigStore::default();
        let mut config = ManagerConfig::new();
        config.load(&store).await.unwrap();
        assert!(config.get("rest_service_log_level").is_ok());

        config.invalidate("rest_service_log_level").unwrap();
        assert!(config.can_load_from_store());
        assert!(config.get("rest_service_log_level").is_err());

        config.set("postgresql_host", json!("db.internal")).unwrap();
        config.invalidate("postgresql_host").unwrap();
        assert_eq!(config.get("postgresql_host").unwrap(), json!("localhost"));
    }

    #[test]
    fn test_unknown_file_keys_reported() {
        let mut config = ManagerConfig::new();
        let mut values = Map::new();
        values.insert(String::from("secret_key"), json!("abc"));
        values.insert(String::from("bogus"), json!(1));

        let diagnostics = config.apply_file_values(values, "security", "security.yaml");

        assert_eq!(
            diagnostics,
            vec![String::from("Ignoring unknown key 'bogus' in configuration file 'security.yaml'")]
        );
        assert_eq!(config.get("security_secret_key").unwrap(), json!("abc"));
    }

    #[test]
    fn test_public_view_hides_secure_settings() {
        let mut config = ManagerConfig::new();
        config.set("security_secret_key", json!("abc")).unwrap();
        let view = config.public_view();
        assert!(!view.contains_key("security_secret_key"));
        assert!(!view.contains_key("postgresql_password"));
        assert!(view.contains_key("postgresql_host"));
    }

    #[test]
    fn test_database_url() {
        let mut config = ManagerConfig::new();
        config.set("postgresql_password", json!("pw")).unwrap();
        assert_eq!(
            config.database_url().unwrap(),
            "postgresql://stratus:pw@localhost/stratus_db"
        );

        config.set("postgresql_ssl_enabled", json!(true)).unwrap();
        config.set("ca_cert_path", json!("/ca.crt")).unwrap();
        assert_eq!(
            config.database_url().unwrap(),
            "postgresql://stratus:pw@localhost/stratus_db?sslmode=verify-ca&sslrootcert=/ca.crt"
        );

        config.set("postgresql_ssl_client_verification", json!(true)).unwrap();
        config.set("postgresql_ssl_cert_path", json!("/c.crt")).unwrap();
        config.set("postgresql_ssl_key_path", json!("/c.key")).unwrap();
        let url = config.database_url().unwrap();
        assert!(url.contains("sslmode=verify-full&sslcert=/c.crt&sslkey=/c.key"));
    }
}
