//! Execution Context
//!
//! Everything one execution carries through its pipeline: the input files
//! it exclusively owns, statistics derived from them, user parameters, the
//! outputs produced so far and the event sink for its progress.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event::{EventError, EventPublisher, EventSink, ExecutionEvent, ExecutionRef, OutputFile};
use crate::execution::workdir::Workdir;

/// An input file of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Dataset the file belongs to
    #[serde(default)]
    pub dataset: String,
}

impl InputFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size_bytes,
            dataset: String::new(),
        }
    }

    pub fn in_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }
}

/// Aggregated statistics of the input files of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DatasetStats {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Computes per-dataset statistics for a list of input files.
pub fn compute_dataset_stats(inputs: &[InputFile]) -> BTreeMap<String, DatasetStats> {
    let mut stats: BTreeMap<String, DatasetStats> = BTreeMap::new();
    for input in inputs {
        let entry = stats.entry(input.dataset.clone()).or_default();
        entry.file_count += 1;
        entry.total_bytes += input.size_bytes;
    }
    stats
}

/// State threaded through the steps of one execution.
///
/// Cloning is cheap enough to keep a copy around for error recovery; the
/// statistics map is shared and rebuilt, never updated in place.
#[derive(Clone)]
pub struct ExecutionContext {
    process_name: String,
    user: String,
    inputs: Vec<InputFile>,
    dataset_stats: Arc<BTreeMap<String, DatasetStats>>,
    parameters: BTreeMap<String, Value>,
    outputs: Vec<OutputFile>,
    workdir: Option<Workdir>,
    /// Workdirs created and not yet removed, shared by all clones
    live_workdirs: Arc<Mutex<Vec<Workdir>>>,
    timeout: Option<Duration>,
    events: EventSink,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Creates the context of a new execution.
    pub fn new(
        target: ExecutionRef,
        process_name: impl Into<String>,
        user: impl Into<String>,
        inputs: Vec<InputFile>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let dataset_stats = Arc::new(compute_dataset_stats(&inputs));
        Self {
            process_name: process_name.into(),
            user: user.into(),
            inputs,
            dataset_stats,
            parameters: BTreeMap::new(),
            outputs: Vec::new(),
            workdir: None,
            live_workdirs: Arc::new(Mutex::new(Vec::new())),
            timeout: None,
            events: EventSink::new(target, publisher),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the time budget after which the engine fails the execution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the input files and rebuilds the dataset statistics.
    pub fn with_input_files(mut self, inputs: Vec<InputFile>) -> Self {
        self.dataset_stats = Arc::new(compute_dataset_stats(&inputs));
        self.inputs = inputs;
        self
    }

    /// Appends produced output files.
    pub fn with_output_files(mut self, outputs: impl IntoIterator<Item = OutputFile>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn with_workdir(mut self, workdir: Workdir) -> Self {
        self.workdir = Some(workdir);
        self
    }

    pub fn without_workdir(mut self) -> Self {
        self.workdir = None;
        self
    }

    pub fn target(&self) -> ExecutionRef {
        self.events.target()
    }

    pub fn execution_id(&self) -> Uuid {
        self.events.target().execution_id
    }

    pub fn batch_id(&self) -> Uuid {
        self.events.target().batch_id
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn input_files(&self) -> &[InputFile] {
        &self.inputs
    }

    /// Total size of all input files.
    pub fn total_input_bytes(&self) -> u64 {
        self.inputs.iter().map(|f| f.size_bytes).sum()
    }

    pub fn dataset_stats(&self) -> &BTreeMap<String, DatasetStats> {
        &self.dataset_stats
    }

    pub fn stats_for(&self, dataset: &str) -> Option<DatasetStats> {
        self.dataset_stats.get(dataset).copied()
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn output_files(&self) -> &[OutputFile] {
        &self.outputs
    }

    pub fn workdir(&self) -> Option<&Workdir> {
        self.workdir.as_ref()
    }

    fn live_workdirs(&self) -> MutexGuard<'_, Vec<Workdir>> {
        self.live_workdirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a workdir that must be removed when the execution ends.
    pub fn track_workdir(&self, workdir: &Workdir) {
        let mut live = self.live_workdirs();
        if !live.contains(workdir) {
            live.push(workdir.clone());
        }
    }

    /// Forgets a workdir the pipeline removed itself.
    pub fn untrack_workdir(&self, workdir: &Workdir) {
        self.live_workdirs().retain(|w| w != workdir);
    }

    /// Takes the workdirs still on disk, e.g. after the pipeline was abandoned.
    pub fn take_live_workdirs(&self) -> Vec<Workdir> {
        std::mem::take(&mut *self.live_workdirs())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Publishes an event for this execution.
    pub fn send_event(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.events.send(event)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id())
            .field("batch_id", &self.batch_id())
            .field("process", &self.process_name)
            .field("user", &self.user)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("workdir", &self.workdir)
            .finish()
    }
}
