//! Execution Timeline
//!
//! Records published events with their arrival time, for reports, tests and
//! ASCII charts of execution durations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use uuid::Uuid;

use crate::process::{EventError, EventPublisher, ExecutionEvent, ExecutionRef, StepStatus};

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Execution the event belongs to
    pub target: ExecutionRef,
    pub event: ExecutionEvent,
    /// When the event was published
    pub timestamp: Instant,
}

/// An [`EventPublisher`] keeping every event in memory.
#[derive(Debug)]
pub struct EventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
    start_time: Instant,
}

impl EventRecorder {
    /// Creates an empty recorder starting now.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns all recorded events in publication order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().clone()
    }

    /// Events of one execution, in publication order.
    pub fn events_for(&self, execution_id: Uuid) -> Vec<ExecutionEvent> {
        self.lock()
            .iter()
            .filter(|r| r.target.execution_id == execution_id)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Events of every execution of a batch.
    pub fn events_for_batch(&self, batch_id: Uuid) -> Vec<RecordedEvent> {
        self.lock()
            .iter()
            .filter(|r| r.target.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Statuses of the steps published for one execution.
    pub fn statuses_for(&self, execution_id: Uuid) -> Vec<StepStatus> {
        self.events_for(execution_id)
            .iter()
            .filter_map(|e| e.step().map(|s| s.status))
            .collect()
    }

    /// The final event of an execution, if it was published.
    pub fn final_for(&self, execution_id: Uuid) -> Option<ExecutionEvent> {
        self.events_for(execution_id)
            .into_iter()
            .find(ExecutionEvent::is_final)
    }

    /// Execution ids in order of their first event.
    pub fn execution_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for recorded in self.lock().iter() {
            if !ids.contains(&recorded.target.execution_id) {
                ids.push(recorded.target.execution_id);
            }
        }
        ids
    }

    /// Returns the total elapsed time since the recorder was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Milliseconds from the first to the final event of each ended execution.
    pub fn durations(&self) -> HashMap<Uuid, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(id, (start, end))| end.map(|end| (id, end - start)))
            .collect()
    }

    /// First and final event offsets per execution, in milliseconds.
    fn spans(&self) -> HashMap<Uuid, (u128, Option<u128>)> {
        let mut spans: HashMap<Uuid, (u128, Option<u128>)> = HashMap::new();

        for recorded in self.lock().iter() {
            let elapsed = recorded
                .timestamp
                .duration_since(self.start_time)
                .as_millis();
            let span = spans
                .entry(recorded.target.execution_id)
                .or_insert((elapsed, None));
            if recorded.event.is_final() {
                span.1 = Some(elapsed);
            }
        }

        spans
    }

    /// Generates an ASCII chart of the executions.
    ///
    /// Each ended execution is shown as a bar indicating when it ran
    /// relative to the total time; running ones are listed as such.
    pub fn summary(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis().max(1);
        let scale = 50.0 / total_time as f64;

        let spans = self.spans();
        let mut sorted: Vec<_> = self
            .execution_ids()
            .into_iter()
            .filter_map(|id| spans.get(&id).map(|span| (id, *span)))
            .collect();
        sorted.sort_by_key(|(_, (start, _))| *start);

        for (id, (start, end)) in sorted {
            let label = short_id(id);
            match end {
                Some(end) => {
                    let start_pos = (start as f64 * scale) as usize;
                    let width = ((end - start) as f64 * scale).max(1.0) as usize;

                    let mut bar = " ".repeat(start_pos);
                    bar.push_str(&"#".repeat(width));
                    output.push_str(&format!("{} |{}| ({} ms)\n", label, bar, end - start));
                }
                None => output.push_str(&format!("{} | running\n", label)),
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventRecorder {
    fn publish(&self, target: ExecutionRef, event: ExecutionEvent) -> Result<(), EventError> {
        self.lock().push(RecordedEvent {
            target,
            event,
            timestamp: Instant::now(),
        });
        Ok(())
    }
}

/// First eight characters of an execution id.
fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
