//! Process Registry
//!
//! Resolves process names to fully built [`PProcess`](crate::process::PProcess)
//! descriptors.
//!
//! # Components
//!
//! - [`definition`]: raw process definitions and catalogs
//! - [`validator`]: structural checks on definitions
//! - [`store`]: where definitions come from (memory, YAML file)
//! - [`plugins`]: plugins building pipelines from definitions
//! - [`resolver`]: the cached registry itself

pub mod definition;
pub mod plugins;
pub mod resolver;
pub mod store;
pub mod validator;

pub use definition::{Catalog, ProcessDefinition, QuotaDefinition, RightsDefinition};
pub use plugins::{register_builtin_plugins, PluginDescriptor, PluginRegistry};
pub use resolver::{CatalogReport, ProcessRegistry};
pub use store::{
    load_catalog, DefinitionStore, InMemoryDefinitionStore, LoadedCatalog, SkippedProcess,
    YamlDefinitionStore,
};
pub use validator::{validate_catalog, validate_definition, ValidationError};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::forecast::ForecastParseError;

/// Errors raised while resolving processes. Always fatal for the process.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("no process definition named '{0}'")]
    MissingDefinition(String),

    #[error("process '{0}' is not active")]
    Disabled(String),

    #[error("process '{process}': {source}")]
    InvalidForecast {
        process: String,
        #[source]
        source: ForecastParseError,
    },

    #[error("process '{process}': invalid quota: {reason}")]
    InvalidQuota { process: String, reason: String },

    #[error("process '{process}' uses unknown engine '{engine}'")]
    UnknownEngine { process: String, engine: String },

    #[error("process '{process}' uses unknown plugin '{plugin}'")]
    UnknownPlugin { process: String, plugin: String },

    #[error("a plugin with id '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("process '{process}' is invalid: {}", .reasons.join("; "))]
    InvalidDefinition {
        process: String,
        reasons: Vec<String>,
    },

    #[error("process '{process}': invalid plugin configuration: {reason}")]
    PluginConfig { process: String, reason: String },

    #[error("failed to read catalog '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
