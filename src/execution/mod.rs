//! Execution Module
//!
//! Composes and runs the pipelines of processes.
//!
//! # Architecture
//!
//! - [`executable`]: the step combinator (`and_then`, `on_error`, `interrupt`)
//! - [`engine`]: the engine trait, handles and the engine registry
//! - [`engines`]: built-in tokio and queued engines
//! - [`workdir`]: per-execution working directories and storage
//! - [`shell`]: bash script processes

pub mod engine;
pub mod engines;
pub mod executable;
pub mod shell;
pub mod workdir;

pub use engine::{
    drive, register_default_engines, EngineRegistry, EngineSetupError, ExecutionHandle,
    WorkloadEngine,
};
pub use engines::{QueuedEngine, TokioEngine};
pub use executable::{Executable, ExecutionError, Outcome};
pub use shell::ShellProcess;
pub use workdir::{in_workdir, Workdir, WorkdirRoots};
