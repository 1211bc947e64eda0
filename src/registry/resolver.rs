//! Process Resolution
//!
//! [`ProcessRegistry`] turns definitions into [`PProcess`] descriptors:
//! 1. Validate the definition
//! 2. Parse size and duration forecasts (invalid expressions are fatal)
//! 3. Build quotas (absent ones never reject)
//! 4. Resolve rights
//! 5. Bind the named engine (unknown engines are fatal)
//! 6. Compile the pipeline with the named plugin
//!
//! Resolved processes are cached by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::definition::ProcessDefinition;
use super::plugins::PluginRegistry;
use super::store::{DefinitionStore, SkippedProcess};
use super::validator::validate_definition;
use super::ConfigurationError;
use crate::execution::EngineRegistry;
use crate::forecast::{parse_byte_size, DurationForecast, SizeForecast};
use crate::process::PProcess;
use crate::quota::ExecutionQuota;

/// Result of resolving a whole catalog.
#[derive(Debug, Default)]
pub struct CatalogReport {
    pub processes: Vec<Arc<PProcess>>,
    pub skipped: Vec<SkippedProcess>,
}

impl CatalogReport {
    pub fn names(&self) -> Vec<&str> {
        self.processes.iter().map(|p| p.name()).collect()
    }
}

/// Resolves and caches process descriptors.
pub struct ProcessRegistry {
    store: Arc<dyn DefinitionStore>,
    engines: EngineRegistry,
    plugins: PluginRegistry,
    cache: Mutex<HashMap<String, Arc<PProcess>>>,
}

impl ProcessRegistry {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        engines: EngineRegistry,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            store,
            engines,
            plugins,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<PProcess>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the process with the given name, resolving it on first use.
    pub async fn find_by_name(&self, name: &str) -> Result<Arc<PProcess>, ConfigurationError> {
        if let Some(process) = self.cache().get(name) {
            debug!("Process '{}' served from cache", name);
            return Ok(Arc::clone(process));
        }

        let definition = self
            .store
            .find_by_name(name)
            .await?
            .ok_or_else(|| ConfigurationError::MissingDefinition(name.to_string()))?;

        if !definition.active {
            return Err(ConfigurationError::Disabled(name.to_string()));
        }

        self.resolve_cached(&definition)
    }

    /// Resolves every active definition independently.
    ///
    /// Unreadable or unresolvable entries do not stop the listing; each is
    /// logged and reported in [`CatalogReport::skipped`]. Only a failing
    /// store is an error.
    pub async fn find_all(&self) -> Result<CatalogReport, ConfigurationError> {
        let loaded = self.store.find_all().await?;
        let mut report = CatalogReport::default();

        for skipped in loaded.rejected {
            warn!("Skipping process '{}': {}", skipped.name, skipped.error);
            report.skipped.push(skipped);
        }

        for definition in loaded.definitions {
            if !definition.active {
                debug!("Process '{}' is inactive", definition.name);
                continue;
            }

            match self.resolve_cached(&definition) {
                Ok(process) => report.processes.push(process),
                Err(error) => {
                    warn!("Skipping process '{}': {}", definition.name, error);
                    report.skipped.push(SkippedProcess {
                        name: definition.name.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            "Catalog resolved: {} processes, {} skipped",
            report.processes.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn resolve_cached(&self, definition: &ProcessDefinition) -> Result<Arc<PProcess>, ConfigurationError> {
        if let Some(process) = self.cache().get(&definition.name) {
            return Ok(Arc::clone(process));
        }

        let process = Arc::new(self.resolve(definition)?);
        self.cache()
            .insert(definition.name.clone(), Arc::clone(&process));
        Ok(process)
    }

    /// Drops a cached process so that it is resolved again on next use.
    pub fn invalidate(&self, name: &str) -> bool {
        self.cache().remove(name).is_some()
    }

    /// Builds a descriptor from a definition without touching the cache.
    pub fn resolve(&self, definition: &ProcessDefinition) -> Result<PProcess, ConfigurationError> {
        let name = &definition.name;

        let errors = validate_definition(definition);
        if !errors.is_empty() {
            return Err(ConfigurationError::InvalidDefinition {
                process: name.clone(),
                reasons: errors.iter().map(|e| e.to_string()).collect(),
            });
        }

        let size_forecast = definition
            .size_forecast
            .as_deref()
            .map(str::parse::<SizeForecast>)
            .transpose()
            .map_err(|source| ConfigurationError::InvalidForecast {
                process: name.clone(),
                source,
            })?;

        let duration_forecast = definition
            .duration_forecast
            .as_deref()
            .map(str::parse::<DurationForecast>)
            .transpose()
            .map_err(|source| ConfigurationError::InvalidForecast {
                process: name.clone(),
                source,
            })?;

        let parallel_quota = definition
            .quotas
            .max_parallel_executions_per_user
            .map_or_else(
                ExecutionQuota::never_violated,
                ExecutionQuota::max_parallel_executions_for_user,
            );

        let cache_quota = match &definition.quotas.max_bytes_in_cache {
            None => ExecutionQuota::never_violated(),
            Some(expr) => {
                let bytes =
                    parse_byte_size(expr).ok_or_else(|| ConfigurationError::InvalidQuota {
                        process: name.clone(),
                        reason: format!("'{}' is not a size", expr),
                    })?;
                ExecutionQuota::max_bytes_in_cache(bytes)
            }
        };

        let engine =
            self.engines
                .find(&definition.engine)
                .ok_or_else(|| ConfigurationError::UnknownEngine {
                    process: name.clone(),
                    engine: definition.engine.clone(),
                })?;

        let plugin =
            self.plugins
                .find(&definition.plugin)
                .ok_or_else(|| ConfigurationError::UnknownPlugin {
                    process: name.clone(),
                    plugin: definition.plugin.clone(),
                })?;
        let executable = plugin.build(definition)?;

        info!(
            "Resolved process '{}' (plugin: {}, engine: {})",
            name, definition.plugin, definition.engine
        );

        Ok(PProcess::new(name.clone(), engine, executable)
            .with_plugin(plugin.id.clone(), plugin.capabilities.clone())
            .with_parallel_quota(parallel_quota)
            .with_cache_quota(cache_quota)
            .with_rights(definition.rights.clone().into())
            .with_parameters(definition.parameters.clone())
            .with_size_forecast(size_forecast)
            .with_duration_forecast(duration_forecast))
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("engines", &self.engines)
            .field("plugins", &self.plugins)
            .field("cached", &self.cache().len())
            .finish()
    }
}
