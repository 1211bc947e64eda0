//! Process Model
//!
//! Data types describing processes and their executions.
//!
//! # Components
//!
//! - [`step`]: step statuses and their transitions
//! - [`event`]: the event protocol and publishers
//! - [`context`]: per-execution state threaded through pipelines
//! - [`descriptor`]: resolved process descriptors, rights and parameters

pub mod context;
pub mod descriptor;
pub mod event;
pub mod step;

pub use context::{compute_dataset_stats, DatasetStats, ExecutionContext, InputFile};
pub use descriptor::{
    ApplicationMode, Capabilities, EntityType, PProcess, ParameterDescriptor, ParameterError,
    ParameterKind, Rights,
};
pub use event::{
    ChannelPublisher, EventError, EventPublisher, EventSink, ExecutionEvent, ExecutionRef,
    FinalEvent, IntermediaryEvent, OutputFile, PublishedEvent,
};
pub use step::{PStep, StepStatus};
