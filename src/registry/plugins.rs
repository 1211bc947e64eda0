//! Process Plugins
//!
//! A plugin turns a process definition into a compiled pipeline. Plugins
//! declare what they can be applied to when they are registered, and are
//! looked up by id.
//!
//! Built-in plugins:
//! - `shell`: runs the `script` of the definition in a per-execution workdir
//! - `copy`: copies the inputs to the outputs unchanged

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use super::definition::ProcessDefinition;
use super::ConfigurationError;
use crate::execution::shell::parse_env_spec;
use crate::execution::{in_workdir, Executable, ExecutionError, ShellProcess, WorkdirRoots};
use crate::process::{ApplicationMode, Capabilities, EntityType, ExecutionContext};

type Factory =
    Arc<dyn Fn(&ProcessDefinition) -> Result<Executable, ConfigurationError> + Send + Sync>;

/// A registered plugin and its declared capabilities.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub description: String,
    pub capabilities: Capabilities,
    factory: Factory,
}

impl PluginDescriptor {
    pub fn new<F>(
        id: impl Into<String>,
        description: impl Into<String>,
        capabilities: Capabilities,
        factory: F,
    ) -> Self
    where
        F: Fn(&ProcessDefinition) -> Result<Executable, ConfigurationError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            capabilities,
            factory: Arc::new(factory),
        }
    }

    /// Builds the pipeline of a process using this plugin.
    pub fn build(&self, definition: &ProcessDefinition) -> Result<Executable, ConfigurationError> {
        debug!("Building '{}' with plugin '{}'", definition.name, self.id);
        (self.factory)(definition)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Plugins by id.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: PluginDescriptor) -> Result<(), ConfigurationError> {
        if self.plugins.contains_key(&plugin.id) {
            return Err(ConfigurationError::DuplicatePlugin(plugin.id));
        }
        info!("Registered plugin '{}'", plugin.id);
        self.plugins.insert(plugin.id.clone(), plugin);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(id)
    }

    /// Registered plugins, sorted by id.
    pub fn plugins(&self) -> Vec<&PluginDescriptor> {
        let mut plugins: Vec<_> = self.plugins.values().collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }
}

/// Registers the `shell` and `copy` plugins.
pub fn register_builtin_plugins(
    registry: &mut PluginRegistry,
    roots: WorkdirRoots,
) -> Result<(), ConfigurationError> {
    let shell_roots = roots.clone();
    registry.register(PluginDescriptor::new(
        "shell",
        "Runs a bash script over the input files",
        Capabilities::new(
            &[ApplicationMode::One, ApplicationMode::Many],
            &[EntityType::Data],
        ),
        move |definition| build_shell(definition, shell_roots.clone()),
    ))?;

    registry.register(PluginDescriptor::new(
        "copy",
        "Copies the input files unchanged",
        Capabilities::new(
            &[ApplicationMode::Many],
            &[EntityType::Data, EntityType::Dataset],
        ),
        move |_definition| Ok(in_workdir("copy", copy_inputs(), roots.clone())),
    ))?;

    Ok(())
}

fn build_shell(
    definition: &ProcessDefinition,
    roots: WorkdirRoots,
) -> Result<Executable, ConfigurationError> {
    let plugin_error = |reason: String| ConfigurationError::PluginConfig {
        process: definition.name.clone(),
        reason,
    };

    let script = definition
        .config_str("script")
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| plugin_error("missing 'script'".to_string()))?;

    let env = match definition.config.get("env") {
        None => Vec::new(),
        Some(value) => {
            let spec = value
                .as_str()
                .ok_or_else(|| plugin_error("'env' must be a string".to_string()))?;
            parse_env_spec(spec).map_err(plugin_error)?
        }
    };

    let shell = ShellProcess::new(script).with_env(env);
    Ok(in_workdir("script", shell.executable(), roots))
}

/// Copies every file of the workdir's `input/` into `output/`.
fn copy_inputs() -> Executable {
    Executable::new(|ctx: ExecutionContext| async move {
        let workdir = ctx
            .workdir()
            .cloned()
            .ok_or_else(|| ExecutionError::step("copy", "no workdir was prepared"))?;

        for input in ctx.input_files() {
            tokio::fs::copy(
                workdir.input_dir().join(&input.name),
                workdir.output_dir().join(&input.name),
            )
            .await?;
        }
        Ok(ctx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        register_builtin_plugins(&mut registry, WorkdirRoots::new("/tmp/w", "/tmp/s")).unwrap();
        registry
    }

    #[test]
    fn test_builtin_plugins_registered() {
        let registry = registry();
        let ids: Vec<&str> = registry.plugins().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["copy", "shell"]);

        let copy = registry.find("copy").unwrap();
        assert!(copy.capabilities.supports(ApplicationMode::Many, EntityType::Dataset));
        assert!(!copy.capabilities.supports(ApplicationMode::One, EntityType::Data));
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let mut registry = registry();
        let again = PluginDescriptor::new("copy", "", Capabilities::default(), |_| {
            Ok(Executable::identity())
        });
        assert!(matches!(
            registry.register(again),
            Err(ConfigurationError::DuplicatePlugin(id)) if id == "copy"
        ));
    }

    #[test]
    fn test_shell_requires_script() {
        let registry = registry();
        let shell = registry.find("shell").unwrap();

        let missing = ProcessDefinition::new("p", "shell");
        assert!(matches!(
            shell.build(&missing),
            Err(ConfigurationError::PluginConfig { .. })
        ));

        let bad_env = ProcessDefinition::new("p", "shell")
            .with_config("script", "true")
            .with_config("env", "NOVALUE");
        assert!(matches!(
            shell.build(&bad_env),
            Err(ConfigurationError::PluginConfig { reason, .. }) if reason.contains("NOVALUE")
        ));

        let valid = ProcessDefinition::new("p", "shell")
            .with_config("script", "true")
            .with_config("env", "A=1");
        assert!(shell.build(&valid).is_ok());
    }
}
