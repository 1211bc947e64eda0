//! Monitoring Module
//!
//! Captures the events of executions for reporting.
//!
//! # Components
//!
//! - [`EventRecorder`]: in-memory event publisher with per-execution timing

pub mod timeline;

pub use timeline::{EventRecorder, RecordedEvent};
