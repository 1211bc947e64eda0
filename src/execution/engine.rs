//! Workload Engines
//!
//! A [`WorkloadEngine`] runs a compiled [`Executable`] against an execution
//! context and reports the outcome through the execution's event sink.
//! Nothing is returned synchronously except an [`ExecutionHandle`]: every
//! outcome, including scheduling failures, ends up as a final event.
//!
//! Engines are registered explicitly under their name in an
//! [`EngineRegistry`] at startup, see [`register_default_engines`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::engines::{QueuedEngine, TokioEngine};
use super::executable::{Executable, ExecutionError, Outcome};
use crate::process::{EventSink, ExecutionContext, ExecutionEvent, ExecutionRef, StepStatus};

/// A named runtime able to drive executables.
pub trait WorkloadEngine: Send + Sync {
    /// Name the engine is registered under.
    fn name(&self) -> &str;

    /// Starts running `executable` for the execution described by `ctx`.
    ///
    /// Never fails synchronously; scheduling errors are reported as a
    /// FAILURE final event.
    fn run(&self, executable: Executable, ctx: ExecutionContext) -> ExecutionHandle;
}

/// Handle on a running execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    target: ExecutionRef,
    cancel: CancellationToken,
    done: oneshot::Receiver<StepStatus>,
}

impl ExecutionHandle {
    /// A handle whose status is delivered through the returned sender.
    pub(crate) fn pending(ctx: &ExecutionContext) -> (Self, oneshot::Sender<StepStatus>) {
        let (sender, done) = oneshot::channel();
        let handle = Self {
            target: ctx.target(),
            cancel: ctx.cancellation().clone(),
            done,
        };
        (handle, sender)
    }

    /// A handle for an execution that already ended.
    pub(crate) fn finished(ctx: &ExecutionContext, status: StepStatus) -> Self {
        let (handle, sender) = Self::pending(ctx);
        // The receiver lives in `handle`, so this cannot fail
        let _ = sender.send(status);
        handle
    }

    pub fn target(&self) -> ExecutionRef {
        self.target
    }

    /// Requests cancellation. The pipeline stops at its next safe point.
    pub fn cancel(&self) {
        info!("exec={} cancellation requested", self.target.execution_id);
        self.cancel.cancel();
    }

    /// The token behind [`cancel`](Self::cancel), still usable once
    /// [`wait`](Self::wait) has taken the handle.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the terminal status of the execution.
    pub async fn wait(self) -> StepStatus {
        self.done.await.unwrap_or_else(|_| {
            warn!(
                "exec={} engine dropped the execution without a status",
                self.target.execution_id
            );
            StepStatus::Failure
        })
    }
}

/// Drives one execution to its end and returns its terminal status.
///
/// Applies the context's timeout, turns panics into failures and emits the
/// final event when the pipeline did not emit one itself: SUCCESS with the
/// context's output files after a successful or interrupted chain, FAILURE
/// otherwise. Workdirs still tracked on the context are removed first.
pub async fn drive(executable: Executable, ctx: ExecutionContext) -> StepStatus {
    let sink = ctx.events().clone();
    let cancel = ctx.cancellation().clone();
    let timeout = ctx.timeout();
    let fallback = ctx.clone();

    info!(
        "exec={} starting '{}' for user '{}'",
        ctx.execution_id(),
        ctx.process_name(),
        ctx.user()
    );

    let run = AssertUnwindSafe(executable.run(ctx)).catch_unwind();
    let result = match timeout {
        Some(budget) => match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Ok(Outcome::Failure(
                    fallback.clone(),
                    ExecutionError::TimedOut(budget),
                ))
            }
        },
        None => run.await,
    };

    let outcome = result.unwrap_or_else(|panic| {
        Outcome::Failure(
            fallback.clone(),
            ExecutionError::Panicked(panic_message(panic)),
        )
    });
    remove_live_workdirs(&fallback).await;
    finish(outcome, &sink)
}

/// Removes the workdirs an abandoned pipeline could not clean itself.
async fn remove_live_workdirs(ctx: &ExecutionContext) {
    for workdir in ctx.take_live_workdirs() {
        warn!(
            "exec={} removing leftover workdir {}",
            ctx.execution_id(),
            workdir.path().display()
        );
        if let Err(e) = workdir.clean().await {
            error!(
                "exec={} failed to remove {}: {}",
                ctx.execution_id(),
                workdir.path().display(),
                e
            );
        }
    }
}

/// Emits the final event for a completed pipeline if it is still missing.
fn finish(outcome: Outcome, sink: &EventSink) -> StepStatus {
    let execution_id = sink.target().execution_id;
    let event = match outcome {
        Outcome::Success(ctx) | Outcome::Interrupted(ctx) => {
            info!("exec={} completed", execution_id);
            ExecutionEvent::success("completed", ctx.output_files().to_vec())
        }
        Outcome::Failure(_, err) => {
            error!("exec={} failed: {}", execution_id, err);
            ExecutionEvent::failure(err.to_string())
        }
    };

    if !sink.is_terminated() {
        if let Err(e) = sink.send(event) {
            error!("exec={} could not publish final event: {}", execution_id, e);
        }
    }
    sink.terminal_status().unwrap_or(StepStatus::Failure)
}

/// Reports an execution the engine could not schedule.
pub(crate) fn reject(ctx: &ExecutionContext, engine: &str, reason: impl Into<String>) -> StepStatus {
    let err = ExecutionError::Scheduling {
        engine: engine.to_string(),
        reason: reason.into(),
    };
    finish(Outcome::Failure(ctx.clone(), err), ctx.events())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Errors raised while setting up engines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineSetupError {
    #[error("an engine named '{0}' is already registered")]
    Duplicate(String),

    #[error("engine '{0}' requires a running tokio runtime")]
    NoRuntime(String),
}

/// Engines by name.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn WorkloadEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine under its own name.
    pub fn register(&mut self, engine: Arc<dyn WorkloadEngine>) -> Result<(), EngineSetupError> {
        let name = engine.name().to_string();
        if self.engines.contains_key(&name) {
            return Err(EngineSetupError::Duplicate(name));
        }
        info!("Registered engine '{}'", name);
        self.engines.insert(name, engine);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn WorkloadEngine>> {
        self.engines.get(name).cloned()
    }

    /// Registered engine names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

/// Registers the built-in engines.
///
/// `capacity` bounds the executions each engine runs at once. Must be
/// called from within a tokio runtime.
pub fn register_default_engines(
    registry: &mut EngineRegistry,
    capacity: usize,
) -> Result<(), EngineSetupError> {
    registry.register(Arc::new(TokioEngine::new(capacity)))?;
    registry.register(Arc::new(QueuedEngine::start(capacity, capacity.saturating_mul(4))?))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::monitoring::EventRecorder;
    use crate::process::{OutputFile, PStep};

    fn context(recorder: &Arc<EventRecorder>) -> ExecutionContext {
        ExecutionContext::new(
            ExecutionRef::generate(),
            "proc",
            "alice",
            Vec::new(),
            recorder.clone(),
        )
    }

    fn output(name: &str) -> OutputFile {
        OutputFile {
            name: name.to_string(),
            path: format!("/out/{}", name).into(),
            size_bytes: 1,
            inputs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_drive_emits_success_with_outputs() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder);
        let id = ctx.execution_id();

        let pipeline = Executable::send_event(|_| ExecutionEvent::from_step(PStep::running("go")))
            .and_then(
                "produce",
                Executable::new(|ctx: ExecutionContext| async move {
                    Ok(ctx.with_output_files(vec![output("result.txt")]))
                }),
            );

        assert_eq!(drive(pipeline, ctx).await, StepStatus::Success);

        let events = recorder.events_for(id);
        assert_eq!(events.len(), 2);
        assert!(events[1].is_final());
        assert_eq!(events[1].files()[0].name, "result.txt");
    }

    #[tokio::test]
    async fn test_drive_keeps_final_event_of_pipeline() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder);
        let id = ctx.execution_id();

        let pipeline = Executable::send_event(|_| ExecutionEvent::failure("handled"));
        assert_eq!(drive(pipeline, ctx).await, StepStatus::Failure);
        assert_eq!(recorder.events_for(id).len(), 1);
    }

    #[tokio::test]
    async fn test_drive_converts_error_to_failure() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder);
        let id = ctx.execution_id();

        let pipeline = Executable::new(|_ctx| async move {
            Err(ExecutionError::step("compute", "exit code 1"))
        });
        assert_eq!(drive(pipeline, ctx).await, StepStatus::Failure);

        let last = recorder.final_for(id).unwrap();
        assert_eq!(
            last.step().map(|s| s.message.clone()),
            Some("step 'compute' failed: exit code 1".to_string())
        );
    }

    #[tokio::test]
    async fn test_drive_catches_panics() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder);
        let id = ctx.execution_id();

        let pipeline = Executable::new(|ctx: ExecutionContext| async move {
            if ctx.user() == "alice" {
                panic!("bad input");
            }
            Ok(ctx)
        });
        assert_eq!(drive(pipeline, ctx).await, StepStatus::Failure);
        assert_eq!(recorder.statuses_for(id), vec![StepStatus::Failure]);
    }

    #[tokio::test]
    async fn test_drive_applies_timeout() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder).with_timeout(Duration::from_millis(50));
        let id = ctx.execution_id();
        let cancel = ctx.cancellation().clone();

        let pipeline = Executable::new(|ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ctx)
        });
        assert_eq!(drive(pipeline, ctx).await, StepStatus::Failure);
        assert!(cancel.is_cancelled());
        assert_eq!(recorder.statuses_for(id), vec![StepStatus::Failure]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(TokioEngine::new(1))).unwrap();

        assert_eq!(
            registry.register(Arc::new(TokioEngine::new(2))),
            Err(EngineSetupError::Duplicate("tokio".to_string()))
        );
        assert!(registry.find("tokio").is_some());
        assert!(registry.find("spark").is_none());
    }

    #[tokio::test]
    async fn test_register_default_engines() {
        let mut registry = EngineRegistry::new();
        register_default_engines(&mut registry, 2).unwrap();
        assert_eq!(registry.names(), vec!["queued", "tokio"]);
    }

    #[tokio::test]
    async fn test_finished_handle_reports_status() {
        let recorder = Arc::new(EventRecorder::new());
        let ctx = context(&recorder);
        let status = reject(&ctx, "test", "no capacity");
        assert_eq!(status, StepStatus::Failure);

        let handle = ExecutionHandle::finished(&ctx, status);
        let cancellation = handle.cancellation();
        assert_eq!(handle.wait().await, StepStatus::Failure);

        cancellation.cancel();
        assert!(ctx.is_cancelled());
    }
}
