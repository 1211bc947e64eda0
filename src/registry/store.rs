//! Definition Stores
//!
//! Where process definitions come from. The registry only needs lookups by
//! name and a full listing; stores may be backed by anything.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;

use super::definition::{Catalog, ProcessDefinition};
use super::validator::{validate_catalog, ValidationError};
use super::ConfigurationError;

/// A definition that could not be read or resolved.
#[derive(Debug)]
pub struct SkippedProcess {
    pub name: String,
    pub error: ConfigurationError,
}

/// The content of a store, entry by entry.
#[derive(Debug, Default)]
pub struct LoadedCatalog {
    /// Readable definitions with a unique name
    pub definitions: Vec<ProcessDefinition>,
    /// Entries the store could not turn into a definition
    pub rejected: Vec<SkippedProcess>,
}

impl LoadedCatalog {
    /// Extracts the definition named `name`.
    ///
    /// A rejected entry with that name yields its error.
    pub fn take(self, name: &str) -> Result<Option<ProcessDefinition>, ConfigurationError> {
        if let Some(definition) = self.definitions.into_iter().find(|d| d.name == name) {
            return Ok(Some(definition));
        }
        match self.rejected.into_iter().find(|s| s.name == name) {
            Some(skipped) => Err(skipped.error),
            None => Ok(None),
        }
    }
}

/// Source of raw process definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// The definition with the given name, if any.
    async fn find_by_name(&self, name: &str) -> Result<Option<ProcessDefinition>, ConfigurationError>;

    /// Every stored definition, active or not, and the unreadable entries.
    async fn find_all(&self) -> Result<LoadedCatalog, ConfigurationError>;
}

/// Definitions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<Vec<ProcessDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new(definitions: Vec<ProcessDefinition>) -> Self {
        Self {
            definitions: RwLock::new(definitions),
        }
    }

    /// Adds a definition, replacing any with the same name.
    pub fn insert(&self, definition: ProcessDefinition) {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        definitions.retain(|d| d.name != definition.name);
        definitions.push(definition);
    }

    fn snapshot(&self) -> Vec<ProcessDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl From<Catalog> for InMemoryDefinitionStore {
    fn from(catalog: Catalog) -> Self {
        Self::new(catalog.processes)
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<ProcessDefinition>, ConfigurationError> {
        Ok(self.snapshot().into_iter().find(|d| d.name == name))
    }

    async fn find_all(&self) -> Result<LoadedCatalog, ConfigurationError> {
        Ok(LoadedCatalog {
            definitions: self.snapshot(),
            rejected: Vec::new(),
        })
    }
}

/// Definitions read from a YAML catalog file on every lookup.
#[derive(Debug, Clone)]
pub struct YamlDefinitionStore {
    path: PathBuf,
}

impl YamlDefinitionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DefinitionStore for YamlDefinitionStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<ProcessDefinition>, ConfigurationError> {
        load_catalog(&self.path).await?.take(name)
    }

    async fn find_all(&self) -> Result<LoadedCatalog, ConfigurationError> {
        load_catalog(&self.path).await
    }
}

/// Catalog file with its entries left unparsed.
#[derive(Deserialize, Default)]
struct RawCatalog {
    #[serde(default)]
    processes: Vec<serde_yaml::Value>,
}

/// Loads a catalog from a YAML file.
///
/// Only an unreadable file or a malformed document fail the load. Each entry
/// is read on its own: entries that do not parse, and every entry sharing a
/// name with another, are rejected without affecting the rest.
pub async fn load_catalog(path: impl AsRef<Path>) -> Result<LoadedCatalog, ConfigurationError> {
    let path = path.as_ref();
    info!("Loading catalog from: {}", path.display());

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    let raw: RawCatalog = serde_yaml::from_str(&content)?;
    let mut loaded = LoadedCatalog::default();
    let mut parsed = Vec::with_capacity(raw.processes.len());

    for (index, entry) in raw.processes.into_iter().enumerate() {
        let name = entry_name(&entry, index);
        match serde_yaml::from_value::<ProcessDefinition>(entry) {
            Ok(definition) => parsed.push(definition),
            Err(e) => {
                debug!("Catalog entry '{}' is unreadable: {}", name, e);
                loaded.rejected.push(SkippedProcess {
                    name,
                    error: ConfigurationError::Yaml(e),
                });
            }
        }
    }

    let catalog = Catalog { processes: parsed };
    let duplicated: BTreeSet<String> = match validate_catalog(&catalog) {
        Ok(()) => BTreeSet::new(),
        Err(errors) => errors
            .into_iter()
            .filter_map(|e| match e {
                ValidationError::DuplicateProcess(name) => Some(name),
                _ => None,
            })
            .collect(),
    };

    let (_, unique): (Vec<_>, Vec<_>) = catalog
        .processes
        .into_iter()
        .partition(|d| duplicated.contains(&d.name));
    loaded.definitions = unique;

    for name in duplicated {
        let reason = ValidationError::DuplicateProcess(name.clone()).to_string();
        loaded.rejected.push(SkippedProcess {
            error: ConfigurationError::InvalidDefinition {
                process: name.clone(),
                reasons: vec![reason],
            },
            name,
        });
    }

    info!(
        "Catalog loaded: {} processes, {} rejected",
        loaded.definitions.len(),
        loaded.rejected.len()
    );
    Ok(loaded)
}

/// The `name` of a raw entry, or its position when it has none.
fn entry_name(entry: &serde_yaml::Value, index: usize) -> String {
    entry
        .get("name")
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("processes[{}]", index))
}
