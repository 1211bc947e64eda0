//! Process Definitions
//!
//! Raw, unresolved process definitions as stored in a catalog. Forecasts and
//! the cache quota are kept as text here; they are parsed when the process
//! is resolved.
//!
//! # Example YAML Format
//!
//! ```yaml
//! processes:
//!   - name: uppercase
//!     plugin: shell
//!     engine: tokio
//!     size_forecast: "*1"
//!     duration_forecast: 2s/m
//!     quotas:
//!       max_parallel_executions_per_user: 2
//!       max_bytes_in_cache: 10g
//!     rights:
//!       roles: [ADMIN, USER]
//!       tenants: project1
//!     parameters:
//!       - name: level
//!         kind: integer
//!         optional: true
//!         default: 1
//!     config:
//!       script: tr a-z A-Z < {input} > {output}/result.txt
//!       env: MODE=fast
//! ```

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::TokioEngine;
use crate::process::{ParameterDescriptor, Rights};

/// Declared quotas of a process. Absent values mean unlimited.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_executions_per_user: Option<u32>,

    /// Size expression such as `10g`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes_in_cache: Option<String>,
}

/// Declared rights of a process. Each list accepts a single string.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RightsDefinition {
    #[serde(deserialize_with = "single_or_vec", default)]
    pub tenants: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub roles: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub datasets: Vec<String>,
}

impl From<RightsDefinition> for Rights {
    fn from(rights: RightsDefinition) -> Self {
        Rights {
            tenants: rights.tenants,
            roles: rights.roles,
            datasets: rights.datasets,
        }
    }
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

fn default_engine() -> String {
    TokioEngine::NAME.to_string()
}

fn default_active() -> bool {
    true
}

/// A process as declared in the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    /// Unique process name
    pub name: String,

    /// Id of the plugin building the pipeline
    pub plugin: String,

    /// Name of the engine running the pipeline
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Inactive processes are skipped when listing the catalog
    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_forecast: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_forecast: Option<String>,

    #[serde(default)]
    pub quotas: QuotaDefinition,

    #[serde(default)]
    pub rights: RightsDefinition,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterDescriptor>,

    /// Plugin-specific settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
}

impl ProcessDefinition {
    /// Creates an active definition on the default engine.
    pub fn new(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            plugin: plugin.into().trim().to_string(),
            engine: default_engine(),
            active: true,
            size_forecast: None,
            duration_forecast: None,
            quotas: QuotaDefinition::default(),
            rights: RightsDefinition::default(),
            parameters: Vec::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_size_forecast(mut self, expr: impl Into<String>) -> Self {
        self.size_forecast = Some(expr.into());
        self
    }

    pub fn with_duration_forecast(mut self, expr: impl Into<String>) -> Self {
        self.duration_forecast = Some(expr.into());
        self
    }

    pub fn with_max_parallel(mut self, max: u32) -> Self {
        self.quotas.max_parallel_executions_per_user = Some(max);
        self
    }

    pub fn with_max_cache(mut self, expr: impl Into<String>) -> Self {
        self.quotas.max_bytes_in_cache = Some(expr.into());
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.rights.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterDescriptor) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// A string entry of the plugin configuration.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A catalog of process definitions.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub processes: Vec<ProcessDefinition>,
}

impl Catalog {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn find(&self, name: &str) -> Option<&ProcessDefinition> {
        self.processes.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ParameterKind;

    const CATALOG: &str = r#"
processes:
  - name: uppercase
    plugin: shell
    size_forecast: "*1"
    duration_forecast: 2s/m
    quotas:
      max_parallel_executions_per_user: 2
      max_bytes_in_cache: 10g
    rights:
      roles: [ADMIN, USER]
      tenants: project1
    parameters:
      - name: level
        kind: integer
        optional: true
        default: 1
    config:
      script: "tr a-z A-Z < {input} > {output}/result.txt"
  - name: archive
    plugin: copy
    engine: queued
    active: false
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = Catalog::from_yaml(CATALOG).unwrap();
        assert_eq!(catalog.processes.len(), 2);

        let upper = catalog.find("uppercase").unwrap();
        assert_eq!(upper.engine, "tokio");
        assert!(upper.active);
        assert_eq!(upper.size_forecast.as_deref(), Some("*1"));
        assert_eq!(upper.quotas.max_parallel_executions_per_user, Some(2));
        assert_eq!(upper.quotas.max_bytes_in_cache.as_deref(), Some("10g"));
        assert_eq!(upper.rights.roles, vec!["ADMIN", "USER"]);
        assert_eq!(upper.rights.tenants, vec!["project1"]);
        assert!(upper.rights.datasets.is_empty());
        assert_eq!(upper.parameters[0].kind, ParameterKind::Integer);
        assert_eq!(upper.parameters[0].default, Some(Value::from(1)));
        assert!(upper.config_str("script").unwrap().starts_with("tr a-z"));

        let archive = catalog.find("archive").unwrap();
        assert_eq!(archive.engine, "queued");
        assert!(!archive.active);
        assert!(archive.config.is_empty());
    }

    #[test]
    fn test_rights_reject_non_strings() {
        let yaml = "processes:\n  - name: p\n    plugin: copy\n    rights:\n      roles: [1, 2]\n";
        assert!(Catalog::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_builder() {
        let def = ProcessDefinition::new(" proc ", "shell")
            .with_engine("queued")
            .with_max_parallel(3)
            .with_max_cache("1g")
            .with_roles(&["ADMIN"])
            .with_config("script", "true")
            .inactive();

        assert_eq!(def.name, "proc");
        assert_eq!(def.engine, "queued");
        assert_eq!(def.quotas.max_parallel_executions_per_user, Some(3));
        assert_eq!(def.config_str("script"), Some("true"));
        assert!(!def.active);

        let rights: Rights = def.rights.clone().into();
        assert_eq!(rights.roles, vec!["ADMIN"]);
    }

    #[test]
    fn test_definition_serialization_roundtrip() {
        let def = ProcessDefinition::new("proc", "copy").with_size_forecast("2m");
        let yaml = serde_yaml::to_string(&def).unwrap();
        let parsed: ProcessDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, def);
    }
}
