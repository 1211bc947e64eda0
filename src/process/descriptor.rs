//! Process Descriptors
//!
//! A [`PProcess`] is the fully resolved, immutable description of a named
//! process: its quotas, access rights, declared parameters, forecasts, the
//! engine it runs on and the compiled pipeline it executes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::context::ExecutionContext;
use crate::execution::{Executable, ExecutionHandle, WorkloadEngine};
use crate::forecast::{DurationForecast, SizeForecast};
use crate::quota::ExecutionQuota;

/// How a plugin can be applied to catalog entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationMode {
    /// One execution per entity
    One,
    /// One execution over many entities
    Many,
}

/// Kind of catalog entity a plugin accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Collection,
    Dataset,
    Data,
}

/// Capabilities a plugin declares when it is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub application_modes: Vec<ApplicationMode>,
    pub entity_types: Vec<EntityType>,
}

impl Capabilities {
    pub fn new(application_modes: &[ApplicationMode], entity_types: &[EntityType]) -> Self {
        Self {
            application_modes: application_modes.to_vec(),
            entity_types: entity_types.to_vec(),
        }
    }

    pub fn supports(&self, mode: ApplicationMode, entity: EntityType) -> bool {
        self.application_modes.contains(&mode) && self.entity_types.contains(&entity)
    }
}

/// Who may use a process. Empty lists do not restrict anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    #[serde(default)]
    pub tenants: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub datasets: Vec<String>,
}

impl Rights {
    /// Returns true if the tenant, role and dataset are all allowed.
    pub fn allows(&self, tenant: &str, role: &str, dataset: &str) -> bool {
        fn open_or_listed(allowed: &[String], value: &str) -> bool {
            allowed.is_empty() || allowed.iter().any(|a| a == value)
        }

        open_or_listed(&self.tenants, tenant)
            && open_or_listed(&self.roles, role)
            && open_or_listed(&self.datasets, dataset)
    }
}

/// Type of a declared process parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Float,
    Boolean,
}

impl ParameterKind {
    /// Returns true if `value` is of this kind.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A parameter a process accepts from the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            optional: false,
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Errors in user-supplied parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("missing required parameter '{0}'")]
    Missing(String),

    #[error("parameter '{name}' must be a {expected}")]
    WrongType { name: String, expected: ParameterKind },
}

/// A fully resolved process.
///
/// Built once per process name by the registry and shared behind an `Arc`.
#[derive(Clone)]
pub struct PProcess {
    name: String,
    plugin: String,
    parallel_quota: ExecutionQuota<u32>,
    cache_quota: ExecutionQuota<u64>,
    rights: Rights,
    parameters: Vec<ParameterDescriptor>,
    size_forecast: Option<SizeForecast>,
    duration_forecast: Option<DurationForecast>,
    capabilities: Capabilities,
    engine: Arc<dyn WorkloadEngine>,
    executable: Executable,
}

impl PProcess {
    /// Creates a process with no quotas, no restrictions and no forecasts.
    pub fn new(
        name: impl Into<String>,
        engine: Arc<dyn WorkloadEngine>,
        executable: Executable,
    ) -> Self {
        Self {
            name: name.into(),
            plugin: String::new(),
            parallel_quota: ExecutionQuota::never_violated(),
            cache_quota: ExecutionQuota::never_violated(),
            rights: Rights::default(),
            parameters: Vec::new(),
            size_forecast: None,
            duration_forecast: None,
            capabilities: Capabilities::default(),
            engine,
            executable,
        }
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>, capabilities: Capabilities) -> Self {
        self.plugin = plugin.into();
        self.capabilities = capabilities;
        self
    }

    pub fn with_parallel_quota(mut self, quota: ExecutionQuota<u32>) -> Self {
        self.parallel_quota = quota;
        self
    }

    pub fn with_cache_quota(mut self, quota: ExecutionQuota<u64>) -> Self {
        self.cache_quota = quota;
        self
    }

    pub fn with_rights(mut self, rights: Rights) -> Self {
        self.rights = rights;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterDescriptor>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_size_forecast(mut self, forecast: Option<SizeForecast>) -> Self {
        self.size_forecast = forecast;
        self
    }

    pub fn with_duration_forecast(mut self, forecast: Option<DurationForecast>) -> Self {
        self.duration_forecast = forecast;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn parallel_quota(&self) -> &ExecutionQuota<u32> {
        &self.parallel_quota
    }

    pub fn cache_quota(&self) -> &ExecutionQuota<u64> {
        &self.cache_quota
    }

    pub fn rights(&self) -> &Rights {
        &self.rights
    }

    pub fn allows(&self, tenant: &str, role: &str, dataset: &str) -> bool {
        self.rights.allows(tenant, role, dataset)
    }

    pub fn parameters(&self) -> &[ParameterDescriptor] {
        &self.parameters
    }

    pub fn size_forecast(&self) -> Option<SizeForecast> {
        self.size_forecast
    }

    pub fn duration_forecast(&self) -> Option<DurationForecast> {
        self.duration_forecast
    }

    /// Forecast output size for the given input size.
    pub fn expected_output_bytes(&self, input_bytes: u64) -> Option<u64> {
        self.size_forecast.map(|f| f.expected_bytes(input_bytes))
    }

    /// Forecast running duration for the given input size.
    pub fn expected_duration(&self, input_bytes: u64) -> Option<Duration> {
        self.duration_forecast.map(|f| f.expected_duration(input_bytes))
    }

    pub fn engine(&self) -> &Arc<dyn WorkloadEngine> {
        &self.engine
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    /// Checks user parameters against the declared ones and fills defaults.
    pub fn resolve_parameters(
        &self,
        supplied: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ParameterError> {
        if let Some(unknown) = supplied
            .keys()
            .find(|name| !self.parameters.iter().any(|p| &p.name == *name))
        {
            return Err(ParameterError::Unknown(unknown.clone()));
        }

        let mut resolved = BTreeMap::new();
        for descriptor in &self.parameters {
            let value = match supplied.get(&descriptor.name).or(descriptor.default.as_ref()) {
                Some(value) => value,
                None if descriptor.optional => continue,
                None => return Err(ParameterError::Missing(descriptor.name.clone())),
            };

            if !descriptor.kind.accepts(value) {
                return Err(ParameterError::WrongType {
                    name: descriptor.name.clone(),
                    expected: descriptor.kind,
                });
            }
            resolved.insert(descriptor.name.clone(), value.clone());
        }

        Ok(resolved)
    }

    /// Runs the compiled pipeline of this process on its engine.
    pub fn launch(&self, ctx: ExecutionContext) -> ExecutionHandle {
        self.engine.run(self.executable.clone(), ctx)
    }
}

impl fmt::Debug for PProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PProcess")
            .field("name", &self.name)
            .field("plugin", &self.plugin)
            .field("engine", &self.engine.name())
            .field("parallel_quota", &self.parallel_quota)
            .field("cache_quota", &self.cache_quota)
            .field("size_forecast", &self.size_forecast)
            .field("duration_forecast", &self.duration_forecast)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TokioEngine;
    use crate::forecast::MEGABYTE;

    fn process() -> PProcess {
        PProcess::new("proc", Arc::new(TokioEngine::new(1)), Executable::identity())
    }

    #[test]
    fn test_defaults_are_unrestricted() {
        let process = process();
        assert!(process.parallel_quota().is_unbounded());
        assert!(process.cache_quota().is_unbounded());
        assert!(process.allows("any", "any", "any"));
        assert_eq!(process.expected_output_bytes(10), None);
        assert_eq!(process.engine().name(), "tokio");
    }

    #[test]
    fn test_rights() {
        let rights = Rights {
            tenants: vec!["project1".to_string()],
            roles: vec!["ADMIN".to_string(), "USER".to_string()],
            datasets: Vec::new(),
        };

        assert!(rights.allows("project1", "USER", "whatever"));
        assert!(!rights.allows("project2", "USER", "whatever"));
        assert!(!rights.allows("project1", "PUBLIC", "whatever"));
    }

    #[test]
    fn test_forecasts() {
        let process = process()
            .with_size_forecast(SizeForecast::parse("*2"))
            .with_duration_forecast(DurationForecast::parse("1s/m"));

        assert_eq!(process.expected_output_bytes(MEGABYTE), Some(2 * MEGABYTE));
        assert_eq!(
            process.expected_duration(3 * MEGABYTE),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_capabilities_supports() {
        let caps = Capabilities::new(&[ApplicationMode::Many], &[EntityType::Data]);
        assert!(caps.supports(ApplicationMode::Many, EntityType::Data));
        assert!(!caps.supports(ApplicationMode::One, EntityType::Data));
        assert!(!caps.supports(ApplicationMode::Many, EntityType::Dataset));
    }

    #[test]
    fn test_resolve_parameters() {
        let process = process().with_parameters(vec![
            ParameterDescriptor::new("level", ParameterKind::Integer),
            ParameterDescriptor::new("mode", ParameterKind::String)
                .with_default(Value::from("fast")),
            ParameterDescriptor::new("debug", ParameterKind::Boolean).optional(),
        ]);

        let mut supplied = BTreeMap::new();
        supplied.insert("level".to_string(), Value::from(4));

        let resolved = process.resolve_parameters(&supplied).unwrap();
        assert_eq!(resolved.get("level"), Some(&Value::from(4)));
        assert_eq!(resolved.get("mode"), Some(&Value::from("fast")));
        assert!(!resolved.contains_key("debug"));
    }

    #[test]
    fn test_resolve_parameters_errors() {
        let process = process()
            .with_parameters(vec![ParameterDescriptor::new("level", ParameterKind::Integer)]);

        assert_eq!(
            process.resolve_parameters(&BTreeMap::new()),
            Err(ParameterError::Missing("level".to_string()))
        );

        let mut wrong = BTreeMap::new();
        wrong.insert("level".to_string(), Value::from("high"));
        assert_eq!(
            process.resolve_parameters(&wrong),
            Err(ParameterError::WrongType {
                name: "level".to_string(),
                expected: ParameterKind::Integer
            })
        );

        let mut unknown = BTreeMap::new();
        unknown.insert("colour".to_string(), Value::from("red"));
        assert_eq!(
            process.resolve_parameters(&unknown),
            Err(ParameterError::Unknown("colour".to_string()))
        );
    }
}
