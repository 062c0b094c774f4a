//! Persisted config entries.
//!
//! Entries are addressed either by bare name or by `scope.name`. Updates go
//! through editability and schema checks unless forced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ConfigError, Result};

/// Scope of the entries backing store-backed settings.
pub const REST_SCOPE: &str = "rest";

/// A persisted configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Entry name.
    pub name: String,
    /// Scope the entry belongs to.
    pub scope: String,
    /// Current value.
    pub value: Value,
    /// Whether the entry may be changed without force.
    #[serde(default = "default_editable")]
    pub is_editable: bool,
    /// Optional JSON schema subset the value must satisfy.
    #[serde(default)]
    pub schema: Option<Value>,
    /// When the entry was last changed.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Who last changed the entry.
    #[serde(default)]
    pub updater: Option<String>,
}

const fn default_editable() -> bool {
    true
}

impl ConfigEntry {
    /// Creates an editable entry without schema.
    #[must_use]
    pub fn new(name: impl Into<String>, scope: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
            value,
            is_editable: true,
            schema: None,
            updated_at: None,
            updater: None,
        }
    }

    /// Sets the schema of the entry.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Marks the entry read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.is_editable = false;
        self
    }
}

/// Source of persisted config entries for [`super::ManagerConfig::load`].
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Returns every entry of the given scope.
    async fn config_entries(&self, scope: &str) -> Result<Vec<ConfigEntry>>;
}

/// In-memory collection of config entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigStore {
    entries: Vec<ConfigEntry>,
}

impl ConfigStore {
    /// Inserts or replaces an entry keyed by `(scope, name)`.
    pub fn insert(&mut self, entry: ConfigEntry) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.scope == entry.scope && e.name == entry.name)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    fn position(&self, name: &str) -> Result<usize> {
        let (scope, bare) = match name.split_once('.') {
            Some((scope, bare)) => (Some(scope), bare),
            None => (None, name),
        };

        let matches: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.name == bare && scope.is_none_or(|s| e.scope == s))
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [] => Err(ConfigError::EntryNotFound {
                name: name.to_string(),
            }
            .into()),
            [single] => Ok(*single),
            many => Err(ConfigError::AmbiguousName { count: many.len() }.into()),
        }
    }

    /// Finds an entry by `name` or `scope.name`.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` when nothing matches and `AmbiguousName`
    /// when several scopes hold the name.
    pub fn find_entry(&self, name: &str) -> Result<&ConfigEntry> {
        let index = self.position(name)?;
        Ok(&self.entries[index])
    }

    /// Applies a batch of updates.
    ///
    /// All updates are validated before any of them is written.
    ///
    /// # Errors
    ///
    /// Returns a conflict error for non-editable entries (unless `force`)
    /// and for values violating the entry schema.
    pub fn apply_updates(
        &mut self,
        updates: &[(String, Value)],
        updater: &str,
        force: bool,
    ) -> Result<Vec<ConfigEntry>> {
        let mut planned = Vec::with_capacity(updates.len());

        for (name, value) in updates {
            let index = self.position(name)?;
            let entry = &self.entries[index];
            if !entry.is_editable && !force {
                return Err(ConfigError::NotEditable {
                    name: entry.name.clone(),
                }
                .into());
            }
            if let Some(schema) = &entry.schema {
                validate_schema(&entry.name, value, schema)?;
            }
            planned.push((index, value.clone()));
        }

        let now = Utc::now();
        let mut changed = Vec::with_capacity(planned.len());
        for (index, value) in planned {
            let entry = &mut self.entries[index];
            entry.value = value;
            entry.updated_at = Some(now);
            entry.updater = Some(updater.to_string());
            info!("Config entry {}.{} updated by {}", entry.scope, entry.name, updater);
            changed.push(entry.clone());
        }
        Ok(changed)
    }
}

#[async_trait]
impl SettingsSource for ConfigStore {
    async fn config_entries(&self, scope: &str) -> Result<Vec<ConfigEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.scope == scope)
            .cloned()
            .collect())
    }
}

/// Validates `value` against the supported schema subset
/// (`type`, `minimum`, `maximum`, `enum`).
///
/// # Errors
///
/// Returns `SchemaViolation` describing the first failed constraint.
pub fn validate_schema(name: &str, value: &Value, schema: &Value) -> Result<()> {
    let violation = |message: String| -> Result<()> {
        Err(ConfigError::SchemaViolation {
            name: name.to_string(),
            message,
        }
        .into())
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return violation(format!("{value} is not of type '{expected}'"));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if number < min {
                return violation(format!("{value} is less than the minimum of {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if number > max {
                return violation(format!("{value} is greater than the maximum of {max}"));
            }
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return violation(format!("{value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn sample_store() -> ConfigStore {
        let mut store = ConfigStore::default();
        store.insert(
            ConfigEntry::new("rest_service_log_level", "rest", json!("INFO"))
                .with_schema(json!({"type": "string", "enum": ["DEBUG", "INFO", "WARNING"]})),
        );
        store.insert(
            ConfigEntry::new("max_workers", "rest", json!(5))
                .with_schema(json!({"type": "integer", "minimum": 1, "maximum": 10})),
        );
        store.insert(ConfigEntry::new("max_workers", "agent", json!(3)));
        store.insert(ConfigEntry::new("ldap_server", "rest", json!(null)).read_only());
        store
    }

    #[test]
    fn test_find_entry_by_scope() {
        let store = sample_store();
        assert_eq!(store.find_entry("agent.max_workers").unwrap().value, json!(3));
        assert_eq!(store.find_entry("rest_service_log_level").unwrap().scope, "rest");
    }

    #[test]
    fn test_find_entry_ambiguous() {
        let store = sample_store();
        let err = store.find_entry("max_workers").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("Expected 1 value, but found 2"));
    }

    #[test]
    fn test_find_entry_missing() {
        let store = sample_store();
        let err = store.find_entry("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_update_not_editable() {
        let mut store = sample_store();
        let updates = vec![(String::from("ldap_server"), json!("ldap://x"))];

        let err = store.apply_updates(&updates, "admin", false).unwrap_err();
        assert!(err.to_string().contains("ldap_server is not editable"));

        let changed = store.apply_updates(&updates, "admin", true).unwrap();
        assert_eq!(changed[0].value, json!("ldap://x"));
        assert_eq!(changed[0].updater.as_deref(), Some("admin"));
    }

    #[test]
    fn test_update_schema_violation_is_atomic() {
        let mut store = sample_store();
        let updates = vec![
            (String::from("rest_service_log_level"), json!("DEBUG")),
            (String::from("rest.max_workers"), json!(50)),
        ];

        let err = store.apply_updates(&updates, "admin", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            store.find_entry("rest_service_log_level").unwrap().value,
            json!("INFO")
        );
    }

    #[test]
    fn test_schema_enum_and_type() {
        let schema = json!({"type": "string", "enum": ["a", "b"]});
        assert!(validate_schema("x", &json!("a"), &schema).is_ok());
        assert!(validate_schema("x", &json!("c"), &schema).is_err());
        assert!(validate_schema("x", &json!(1), &schema).is_err());
    }
}
