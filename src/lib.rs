//! ProcRunner - Asynchronous Process Execution Engine
//!
//! Runs named processes against batches of input files. Each process is
//! resolved from a catalog into a descriptor carrying its quotas, access
//! rights, cost forecasts, the engine it runs on and its compiled pipeline.
//! Executions report their progress through a strict event protocol ending
//! in exactly one final event.
//!
//! # Architecture
//!
//! - [`forecast`]: size and duration forecast expressions
//! - [`quota`]: quota predicates and admission control
//! - [`process`]: steps, events, execution contexts and process descriptors
//! - [`execution`]: the step combinator, engines, workdirs and shell processes
//! - [`registry`]: catalogs, plugins and process resolution
//! - [`monitoring`]: event recording and timelines
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use procrunner::execution::{register_default_engines, EngineRegistry, WorkdirRoots};
//! use procrunner::monitoring::EventRecorder;
//! use procrunner::process::{ExecutionContext, ExecutionRef, InputFile};
//! use procrunner::quota::AdmissionController;
//! use procrunner::registry::{
//!     register_builtin_plugins, PluginRegistry, ProcessRegistry, YamlDefinitionStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engines = EngineRegistry::new();
//!     register_default_engines(&mut engines, 4)?;
//!     let mut plugins = PluginRegistry::new();
//!     register_builtin_plugins(&mut plugins, WorkdirRoots::from_env())?;
//!
//!     let store = Arc::new(YamlDefinitionStore::new("catalog.yaml"));
//!     let registry = ProcessRegistry::new(store, engines, plugins);
//!     let process = registry.find_by_name("uppercase").await?;
//!
//!     let inputs = vec![InputFile::new("a.txt", "/data/a.txt", 1024)];
//!     let admissions = AdmissionController::new();
//!     let Some(_permit) = admissions.admit("alice", &process, 1024).permit() else {
//!         return Ok(()); // refused, retry later
//!     };
//!
//!     let recorder = Arc::new(EventRecorder::new());
//!     let ctx = ExecutionContext::new(ExecutionRef::generate(), process.name(), "alice", inputs, recorder);
//!     let status = process.launch(ctx).wait().await;
//!     println!("finished with {}", status);
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod forecast;
pub mod monitoring;
pub mod process;
pub mod quota;
pub mod registry;

// Re-export commonly used types
pub use execution::{Executable, ExecutionError, ExecutionHandle, Outcome, WorkloadEngine};
pub use forecast::{DurationForecast, SizeForecast};
pub use process::{ExecutionContext, ExecutionEvent, PProcess, PStep, StepStatus};
pub use quota::{AdmissionController, ExecutionQuota};
pub use registry::{ConfigurationError, ProcessRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ProcRunner";
