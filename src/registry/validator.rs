//! Definition Validation
//!
//! Structural checks on process definitions:
//! - Required fields are present
//! - Parameter declarations are unique and defaults match their kind
//! - Process names are unique within a catalog
//!
//! Forecast expressions and quotas are checked when a process is resolved.

use std::collections::HashSet;

use log::{debug, info};

use super::definition::{Catalog, ProcessDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyName,
    EmptyPlugin(String),
    EmptyEngine(String),
    DuplicateProcess(String),
    DuplicateParameter { process: String, parameter: String },
    InvalidDefault { process: String, parameter: String },
    ZeroParallelQuota(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Process has empty or whitespace-only name"),
            Self::EmptyPlugin(process) => write!(f, "Process '{}' has no plugin specified", process),
            Self::EmptyEngine(process) => write!(f, "Process '{}' has no engine specified", process),
            Self::DuplicateProcess(process) => write!(f, "Duplicate process name: '{}'", process),
            Self::DuplicateParameter { process, parameter } => write!(
                f,
                "Process '{}' declares parameter '{}' more than once",
                process, parameter
            ),
            Self::InvalidDefault { process, parameter } => write!(
                f,
                "Process '{}': default of parameter '{}' does not match its kind",
                process, parameter
            ),
            Self::ZeroParallelQuota(process) => write!(
                f,
                "Process '{}' allows zero parallel executions and could never run",
                process
            ),
        }
    }
}

/// Validates a single definition's fields.
pub fn validate_definition(definition: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
        return errors; // Can't validate further without a name
    }
    let name = &definition.name;

    if definition.plugin.trim().is_empty() {
        errors.push(ValidationError::EmptyPlugin(name.clone()));
    }

    if definition.engine.trim().is_empty() {
        errors.push(ValidationError::EmptyEngine(name.clone()));
    }

    if definition.quotas.max_parallel_executions_per_user == Some(0) {
        errors.push(ValidationError::ZeroParallelQuota(name.clone()));
    }

    let mut seen = HashSet::new();
    for parameter in &definition.parameters {
        if !seen.insert(parameter.name.as_str()) {
            errors.push(ValidationError::DuplicateParameter {
                process: name.clone(),
                parameter: parameter.name.clone(),
            });
        }

        if let Some(default) = &parameter.default {
            if !parameter.kind.accepts(default) {
                errors.push(ValidationError::InvalidDefault {
                    process: name.clone(),
                    parameter: parameter.name.clone(),
                });
            }
        }
    }

    if definition.size_forecast.is_none() {
        debug!("Process '{}' declares no size forecast", name);
    }

    errors
}

/// Validates a whole catalog.
///
/// Only names are checked across entries; a definition with invalid fields
/// does not make the catalog invalid, it fails when it is resolved.
pub fn validate_catalog(catalog: &Catalog) -> Result<(), Vec<ValidationError>> {
    info!("Validating catalog with {} processes", catalog.processes.len());

    let mut seen = HashSet::new();
    let errors: Vec<ValidationError> = catalog
        .processes
        .iter()
        .filter(|p| !seen.insert(p.name.as_str()))
        .map(|p| ValidationError::DuplicateProcess(p.name.clone()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
