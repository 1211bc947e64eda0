//! Execution Events
//!
//! The event protocol through which an execution reports its progress.
//! For one execution, any number of intermediary and output-file events
//! may be published, followed by at most one final event. Nothing is
//! published for an execution after its final event.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::step::{PStep, StepStatus};

/// Errors raised by the event protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("intermediary event cannot carry terminal step {0}")]
    TerminalIntermediary(StepStatus),

    #[error("final event requires a terminal step, got {0}")]
    NonTerminalFinal(StepStatus),

    #[error("execution {0} already emitted its final event")]
    AlreadyTerminated(Uuid),

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("failed to publish event: {0}")]
    Publish(String),
}

/// A file produced by an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Names of the input files this output was derived from
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

/// Progress event carrying a non-terminal step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntermediaryEvent {
    step: PStep,
}

impl IntermediaryEvent {
    pub fn new(step: PStep) -> Result<Self, EventError> {
        if step.is_terminal() {
            return Err(EventError::TerminalIntermediary(step.status));
        }
        Ok(Self { step })
    }

    pub fn step(&self) -> &PStep {
        &self.step
    }
}

/// Terminal event carrying a terminal step and the execution outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalEvent {
    step: PStep,
    output_files: Vec<OutputFile>,
}

impl FinalEvent {
    pub fn new(step: PStep, output_files: Vec<OutputFile>) -> Result<Self, EventError> {
        if !step.is_terminal() {
            return Err(EventError::NonTerminalFinal(step.status));
        }
        Ok(Self { step, output_files })
    }

    pub fn step(&self) -> &PStep {
        &self.step
    }

    pub fn output_files(&self) -> &[OutputFile] {
        &self.output_files
    }
}

/// An event published for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Intermediary(IntermediaryEvent),
    Final(FinalEvent),
    OutputFiles { output_files: Vec<OutputFile> },
}

impl ExecutionEvent {
    /// Wraps a non-terminal step; rejects terminal ones.
    pub fn intermediary(step: PStep) -> Result<Self, EventError> {
        IntermediaryEvent::new(step).map(Self::Intermediary)
    }

    /// Wraps a terminal step and outputs; rejects non-terminal steps.
    pub fn final_event(step: PStep, output_files: Vec<OutputFile>) -> Result<Self, EventError> {
        FinalEvent::new(step, output_files).map(Self::Final)
    }

    /// Streams a batch of partial results.
    pub fn output_files(output_files: Vec<OutputFile>) -> Self {
        Self::OutputFiles { output_files }
    }

    /// Picks the event kind matching the step's terminality.
    pub fn from_step(step: PStep) -> Self {
        if step.is_terminal() {
            Self::Final(FinalEvent {
                step,
                output_files: Vec::new(),
            })
        } else {
            Self::Intermediary(IntermediaryEvent { step })
        }
    }

    /// Successful final event with the given outputs.
    pub fn success(message: impl Into<String>, output_files: Vec<OutputFile>) -> Self {
        Self::Final(FinalEvent {
            step: PStep::success(message),
            output_files,
        })
    }

    /// Failed final event.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Final(FinalEvent {
            step: PStep::failure(message),
            output_files: Vec::new(),
        })
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    /// The step carried by this event, if any.
    pub fn step(&self) -> Option<&PStep> {
        match self {
            Self::Intermediary(event) => Some(event.step()),
            Self::Final(event) => Some(event.step()),
            Self::OutputFiles { .. } => None,
        }
    }

    /// The files carried by this event.
    pub fn files(&self) -> &[OutputFile] {
        match self {
            Self::Intermediary(_) => &[],
            Self::Final(event) => event.output_files(),
            Self::OutputFiles { output_files } => output_files,
        }
    }
}

/// Identifies the execution (and its batch) an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionRef {
    pub execution_id: Uuid,
    pub batch_id: Uuid,
}

impl ExecutionRef {
    pub fn new(execution_id: Uuid, batch_id: Uuid) -> Self {
        Self {
            execution_id,
            batch_id,
        }
    }

    /// A fresh execution in its own batch.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4(), Uuid::new_v4())
    }
}

/// Messaging channel events are published on.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, target: ExecutionRef, event: ExecutionEvent) -> Result<(), EventError>;
}

/// An event together with the execution it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedEvent {
    pub target: ExecutionRef,
    pub event: ExecutionEvent,
}

/// Publishes events on an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: UnboundedSender<PublishedEvent>,
}

impl ChannelPublisher {
    /// Creates a publisher and the receiving end subscribers read from.
    pub fn new() -> (Self, UnboundedReceiver<PublishedEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, target: ExecutionRef, event: ExecutionEvent) -> Result<(), EventError> {
        self.sender
            .send(PublishedEvent { target, event })
            .map_err(|e| EventError::Publish(e.to_string()))
    }
}

/// Per-execution handle on a publisher enforcing the step state machine.
///
/// Clones share the last sent status, so every step of one execution
/// sees the final event as soon as any of them sends it.
#[derive(Clone)]
pub struct EventSink {
    target: ExecutionRef,
    publisher: Arc<dyn EventPublisher>,
    last: Arc<Mutex<Option<StepStatus>>>,
}

impl EventSink {
    pub fn new(target: ExecutionRef, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            target,
            publisher,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn target(&self) -> ExecutionRef {
        self.target
    }

    /// Publishes an event unless the execution already terminated.
    ///
    /// A step event must follow [`StepStatus::can_transition_to`] from the
    /// last step sent. Output-file events carry no step and only need the
    /// execution to be live.
    pub fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        // Held across publish so no event can overtake the final one
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(status) = *last {
            if status.is_terminal() {
                warn!(
                    "exec={} dropping event after final {}: {:?}",
                    self.target.execution_id, status, event
                );
                return Err(EventError::AlreadyTerminated(self.target.execution_id));
            }
        }

        let next = event.step().map(|step| step.status);
        if let (Some(from), Some(to)) = (*last, next) {
            if !from.can_transition_to(to) {
                warn!(
                    "exec={} dropping event, {} cannot follow {}",
                    self.target.execution_id, to, from
                );
                return Err(EventError::InvalidTransition {
                    id: self.target.execution_id,
                    from,
                    to,
                });
            }
        }

        debug!("exec={} event: {:?}", self.target.execution_id, event);
        self.publisher.publish(self.target, event)?;

        if next.is_some() {
            *last = next;
        }
        Ok(())
    }

    /// Status of the final event, once sent.
    pub fn terminal_status(&self) -> Option<StepStatus> {
        self.last_status().filter(|status| status.is_terminal())
    }

    /// Status of the last step event sent.
    pub fn last_status(&self) -> Option<StepStatus> {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal_status().is_some()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("target", &self.target)
            .field("last", &self.last_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(name: &str) -> OutputFile {
        OutputFile {
            name: name.to_string(),
            path: PathBuf::from(name),
            size_bytes: 1,
            inputs: Vec::new(),
        }
    }

    #[test]
    fn test_intermediary_rejects_terminal_step() {
        assert!(ExecutionEvent::intermediary(PStep::running("ok")).is_ok());
        assert_eq!(
            ExecutionEvent::intermediary(PStep::success("done")),
            Err(EventError::TerminalIntermediary(StepStatus::Success))
        );
    }

    #[test]
    fn test_final_requires_terminal_step() {
        assert!(ExecutionEvent::final_event(PStep::failure("bad"), vec![]).is_ok());
        assert_eq!(
            ExecutionEvent::final_event(PStep::prepare("wait"), vec![]),
            Err(EventError::NonTerminalFinal(StepStatus::Prepare))
        );
    }

    #[test]
    fn test_is_final() {
        assert!(ExecutionEvent::success("done", vec![]).is_final());
        assert!(ExecutionEvent::failure("bad").is_final());
        assert!(!ExecutionEvent::from_step(PStep::running("go")).is_final());
        assert!(!ExecutionEvent::output_files(vec![output("a")]).is_final());
    }

    #[test]
    fn test_from_step_picks_variant() {
        let event = ExecutionEvent::from_step(PStep::failure("bad"));
        assert!(event.is_final());
        assert_eq!(event.step().map(|s| s.status), Some(StepStatus::Failure));

        let event = ExecutionEvent::from_step(PStep::prepare("load"));
        assert!(matches!(event, ExecutionEvent::Intermediary(_)));
    }

    #[test]
    fn test_output_file_event_has_no_step() {
        let event = ExecutionEvent::output_files(vec![output("a"), output("b")]);
        assert!(event.step().is_none());
        assert_eq!(event.files().len(), 2);
    }

    #[tokio::test]
    async fn test_channel_publisher_delivers_in_order() {
        let (publisher, mut receiver) = ChannelPublisher::new();
        let target = ExecutionRef::generate();

        publisher
            .publish(target, ExecutionEvent::from_step(PStep::prepare("p")))
            .unwrap();
        publisher
            .publish(target, ExecutionEvent::success("s", vec![]))
            .unwrap();

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.target, target);
        assert!(!first.event.is_final());
        assert!(second.event.is_final());
    }

    #[test]
    fn test_sink_rejects_events_after_final() {
        let (publisher, mut receiver) = ChannelPublisher::new();
        let target = ExecutionRef::generate();
        let sink = EventSink::new(target, Arc::new(publisher));

        sink.send(ExecutionEvent::from_step(PStep::running("r"))).unwrap();
        sink.send(ExecutionEvent::failure("bad")).unwrap();
        assert_eq!(sink.terminal_status(), Some(StepStatus::Failure));

        let clone = sink.clone();
        assert_eq!(
            clone.send(ExecutionEvent::success("late", vec![])),
            Err(EventError::AlreadyTerminated(target.execution_id))
        );
        assert!(clone.send(ExecutionEvent::output_files(vec![])).is_err());

        let mut delivered = Vec::new();
        while let Ok(published) = receiver.try_recv() {
            delivered.push(published.event);
        }
        assert_eq!(delivered.len(), 2);
        assert!(delivered[1].is_final());
    }

    #[test]
    fn test_sink_rejects_step_going_backwards() {
        let (publisher, mut receiver) = ChannelPublisher::new();
        let target = ExecutionRef::generate();
        let sink = EventSink::new(target, Arc::new(publisher));

        sink.send(ExecutionEvent::from_step(PStep::prepare("p"))).unwrap();
        sink.send(ExecutionEvent::from_step(PStep::running("r"))).unwrap();
        sink.send(ExecutionEvent::from_step(PStep::running("still"))).unwrap();
        sink.send(ExecutionEvent::output_files(vec![output("a")])).unwrap();

        assert_eq!(
            sink.send(ExecutionEvent::from_step(PStep::prepare("again"))),
            Err(EventError::InvalidTransition {
                id: target.execution_id,
                from: StepStatus::Running,
                to: StepStatus::Prepare,
            })
        );
        assert_eq!(sink.last_status(), Some(StepStatus::Running));
        assert!(!sink.is_terminated());

        sink.send(ExecutionEvent::success("done", vec![])).unwrap();

        let mut delivered = Vec::new();
        while let Ok(published) = receiver.try_recv() {
            delivered.push(published.event);
        }
        assert_eq!(delivered.len(), 5);
        assert!(delivered[4].is_final());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(ExecutionEvent::failure("bad")).unwrap();
        assert_eq!(json["type"], "final");
        assert_eq!(json["step"]["status"], "FAILURE");
    }
}
