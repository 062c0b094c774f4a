//! Component declarations read from node properties.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ComponentError, Result};

/// Nested deployment declared by a component node.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentDescriptor {
    /// Nested deployment id.
    pub id: String,
    /// Blueprint of the nested deployment.
    pub blueprint_id: String,
    /// Deployment inputs.
    pub inputs: Value,
}

/// Where to fetch the two halves of a plugin from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// Path or URL of the wagon.
    pub wagon_path: String,
    /// Path or URL of the plugin yaml.
    pub plugin_yaml_path: String,
}

impl PluginSource {
    /// Parses a `plugins` property value.
    ///
    /// `null` is treated as an empty map.
    ///
    /// # Errors
    ///
    /// Returns `WrongPluginsType` if the value is not a mapping, and
    /// `IncompletePlugin` if an entry lacks one of its paths.
    pub fn parse_map(value: &Value) -> Result<BTreeMap<String, Self>> {
        let entries = match value {
            Value::Null => return Ok(BTreeMap::new()),
            Value::Object(entries) => entries,
            other => {
                return Err(ComponentError::WrongPluginsType {
                    value: other.to_string(),
                }
                .into());
            }
        };

        let mut plugins = BTreeMap::new();
        for (name, entry) in entries {
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            let wagon_path = field("wagon_path");
            let plugin_yaml_path = field("plugin_yaml_path");

            if wagon_path.is_empty() || plugin_yaml_path.is_empty() {
                return Err(ComponentError::IncompletePlugin {
                    name: name.clone(),
                    wagon_path,
                    plugin_yaml_path,
                }
                .into());
            }
            plugins.insert(
                name.clone(),
                Self {
                    wagon_path,
                    plugin_yaml_path,
                },
            );
        }
        Ok(plugins)
    }
}

/// Everything a component node asks to provision.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    /// Nested deployment.
    pub deployment: DeploymentDescriptor,
    /// Secrets to create, by key.
    pub secrets: BTreeMap<String, String>,
    /// Raw `plugins` property, validated on upload.
    pub plugins: Value,
    /// Per-component timeout overriding the configured default.
    pub timeout: Option<Duration>,
}

impl ComponentSpec {
    /// Reads a component from node properties.
    ///
    /// The nested deployment id defaults to `default_id` (usually the
    /// owning node instance id).
    ///
    /// # Errors
    ///
    /// Returns `InvalidProperty` if the deployment block lacks a blueprint
    /// id or a property has the wrong shape.
    pub fn from_properties(properties: &BTreeMap<String, Value>, default_id: &str) -> Result<Self> {
        let deployment = properties.get("deployment").cloned().unwrap_or(Value::Null);
        if !deployment.is_object() && !deployment.is_null() {
            return Err(invalid("deployment", "expected a mapping"));
        }

        let blueprint_id = deployment
            .get("blueprint_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("deployment.blueprint_id", "is required"))?
            .to_string();
        let id = deployment
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(default_id)
            .to_string();
        let inputs = deployment
            .get("inputs")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let secrets = match properties.get("secrets") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect(),
            Some(_) => return Err(invalid("secrets", "expected a mapping")),
        };

        let timeout = match properties.get("timeout") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Duration::from_secs(
                value
                    .as_u64()
                    .ok_or_else(|| invalid("timeout", "expected a number of seconds"))?,
            )),
        };

        Ok(Self {
            deployment: DeploymentDescriptor {
                id,
                blueprint_id,
                inputs,
            },
            secrets,
            plugins: properties.get("plugins").cloned().unwrap_or(Value::Null),
            timeout,
        })
    }
}

fn invalid(field: &str, message: &str) -> crate::error::ManagerError {
    ComponentError::InvalidProperty {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_wrong_plugins_type() {
        let err = PluginSource::parse_map(&json!(true)).unwrap_err();
        assert!(err.to_string().contains("Wrong type in plugins: true"));

        let err = PluginSource::parse_map(&json!(["a"])).unwrap_err();
        assert!(err.to_string().contains("Wrong type in plugins"));
    }

    #[test]
    fn test_incomplete_plugin() {
        let err = PluginSource::parse_map(&json!({
            "base_plugin": {"wagon_path": "", "plugin_yaml_path": ""}
        }))
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("You should provide both values wagon_path: '' and plugin_yaml_path: ''")
        );

        let err = PluginSource::parse_map(&json!({
            "base_plugin": {"wagon_path": "w.wgn"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("wagon_path: 'w.wgn'"));
    }

    #[test]
    fn test_plugins_parse() {
        assert!(PluginSource::parse_map(&Value::Null).unwrap().is_empty());
        assert!(PluginSource::parse_map(&json!({})).unwrap().is_empty());

        let plugins = PluginSource::parse_map(&json!({
            "base": {"wagon_path": "http://host/base.wgn", "plugin_yaml_path": "base.yaml"}
        }))
        .unwrap();
        assert_eq!(plugins["base"].plugin_yaml_path, "base.yaml");
    }

    #[test]
    fn test_spec_from_properties() {
        let spec = ComponentSpec::from_properties(
            &props(json!({
                "deployment": {"blueprint_id": "child", "inputs": {"size": 2}},
                "secrets": {"a": "b", "port": 5432},
                "timeout": 30
            })),
            "component_1",
        )
        .unwrap();

        assert_eq!(spec.deployment.id, "component_1");
        assert_eq!(spec.deployment.blueprint_id, "child");
        assert_eq!(spec.deployment.inputs, json!({"size": 2}));
        assert_eq!(spec.secrets["a"], "b");
        assert_eq!(spec.secrets["port"], "5432");
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
        assert!(spec.plugins.is_null());
    }

    #[test]
    fn test_spec_requires_blueprint() {
        let err = ComponentSpec::from_properties(&props(json!({"deployment": {"id": "x"}})), "c")
            .unwrap_err();
        assert!(err.to_string().contains("deployment.blueprint_id"));
    }
}
