//! Ownership record of a component, kept in the owner's runtime properties.
//!
//! The record is the only source of truth for what a component provisioned.
//! Deletion reads it back instead of looking at the current blueprint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ComponentError, Result};

const DEPLOYMENT_KEY: &str = "deployment";
const SECRETS_KEY: &str = "secrets";
const PLUGINS_KEY: &str = "plugins";

/// Nested deployment created by a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    /// Nested deployment id.
    pub id: String,
    /// Blueprint it was created from.
    #[serde(default)]
    pub blueprint_id: String,
}

/// What a component provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentRecord {
    /// The nested deployment, once created.
    pub deployment: Option<DeploymentRef>,
    /// Keys of the secrets created. Values are never recorded.
    pub secrets: BTreeSet<String>,
    /// Ids of the uploaded plugins, in upload order.
    pub plugins: Vec<String>,
}

impl ComponentRecord {
    /// Reads the record from runtime properties.
    ///
    /// Secrets may be recorded as a list of keys or as a key/value mapping;
    /// only the keys are kept. Missing keys yield an empty record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProperty` if a key holds a value of the wrong shape.
    pub fn from_runtime_properties(properties: &BTreeMap<String, Value>) -> Result<Self> {
        let deployment = match properties.get(DEPLOYMENT_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) if map.get("id").is_none_or(Value::is_null) => None,
            Some(value) => Some(
                serde_json::from_value::<DeploymentRef>(value.clone())
                    .map_err(|e| shape_error(DEPLOYMENT_KEY, &e.to_string()))?,
            ),
        };

        let secrets = match properties.get(SECRETS_KEY) {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(keys)) => strings(SECRETS_KEY, keys)?.into_iter().collect(),
            Some(_) => return Err(shape_error(SECRETS_KEY, "expected a list or a mapping")),
        };

        let plugins = match properties.get(PLUGINS_KEY) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(ids)) => strings(PLUGINS_KEY, ids)?,
            Some(_) => return Err(shape_error(PLUGINS_KEY, "expected a list")),
        };

        Ok(Self {
            deployment,
            secrets,
            plugins,
        })
    }

    /// Writes the record into `properties`, replacing its own keys only.
    pub fn store_into(&self, properties: &mut BTreeMap<String, Value>) {
        match &self.deployment {
            Some(deployment) => {
                properties.insert(
                    DEPLOYMENT_KEY.to_string(),
                    serde_json::json!({
                        "id": deployment.id,
                        "blueprint_id": deployment.blueprint_id,
                    }),
                );
            }
            None => {
                properties.remove(DEPLOYMENT_KEY);
            }
        }
        properties.insert(
            SECRETS_KEY.to_string(),
            Value::Array(self.secrets.iter().cloned().map(Value::String).collect()),
        );
        properties.insert(
            PLUGINS_KEY.to_string(),
            Value::Array(self.plugins.iter().cloned().map(Value::String).collect()),
        );
    }

    /// Returns true if nothing was provisioned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deployment.is_none() && self.secrets.is_empty() && self.plugins.is_empty()
    }
}

fn strings(key: &str, values: &[Value]) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| shape_error(key, "expected strings"))
        })
        .collect()
}

fn shape_error(key: &str, message: &str) -> crate::error::ManagerError {
    ComponentError::InvalidProperty {
        field: format!("runtime_properties.{key}"),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_properties() {
        let record = ComponentRecord::from_runtime_properties(&BTreeMap::new()).unwrap();
        assert!(record.is_empty());

        let props: BTreeMap<String, Value> =
            serde_json::from_value(json!({"deployment": {}, "secrets": {}, "plugins": []})).unwrap();
        assert!(ComponentRecord::from_runtime_properties(&props).unwrap().is_empty());
    }

    #[test]
    fn test_secret_mapping_keeps_keys_only() {
        let props: BTreeMap<String, Value> = serde_json::from_value(json!({
            "deployment": {"id": "dep_name"},
            "secrets": {"a": "b"},
            "plugins": ["plugin_id"]
        }))
        .unwrap();
        let record = ComponentRecord::from_runtime_properties(&props).unwrap();
        assert_eq!(record.deployment.as_ref().map(|d| d.id.as_str()), Some("dep_name"));
        assert!(record.secrets.contains("a"));
        assert_eq!(record.plugins, vec![String::from("plugin_id")]);

        let mut stored = BTreeMap::new();
        record.store_into(&mut stored);
        assert!(!serde_json::to_string(&stored).unwrap().contains("\"b\""));
        assert_eq!(ComponentRecord::from_runtime_properties(&stored).unwrap(), record);
    }

    #[test]
    fn test_store_keeps_foreign_keys() {
        let mut props = BTreeMap::new();
        props.insert(String::from("ip"), json!("10.0.0.1"));
        ComponentRecord::default().store_into(&mut props);
        assert_eq!(props["ip"], json!("10.0.0.1"));
    }

    #[test]
    fn test_bad_shape() {
        let props: BTreeMap<String, Value> =
            serde_json::from_value(json!({"plugins": "plugin_id"})).unwrap();
        assert!(ComponentRecord::from_runtime_properties(&props).is_err());
    }
}
