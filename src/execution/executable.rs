//! Executable Combinator
//!
//! An [`Executable`] is one unit of asynchronous work over an
//! [`ExecutionContext`]. Executables compose sequentially:
//!
//! - [`Executable::and_then`]: run the next step only if this one succeeded
//! - [`Executable::on_error`]: recover from a failure of the wrapped chain
//! - [`Executable::interrupt`]: halt the chain after the wrapped step
//!
//! Every run resolves to an [`Outcome`], which decides whether the next
//! step runs. Steps of one chain never run concurrently.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;

use crate::process::{EventError, ExecutionContext, ExecutionEvent};

/// Errors raised while executing a pipeline.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("execution was cancelled")]
    Cancelled,

    #[error("execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("step panicked: {0}")]
    Panicked(String),

    #[error("engine '{engine}' could not schedule the execution: {reason}")]
    Scheduling { engine: String, reason: String },
}

impl ExecutionError {
    /// Shorthand for a failed step.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// How a run of an executable ended.
#[derive(Debug)]
pub enum Outcome {
    Success(ExecutionContext),
    Failure(ExecutionContext, ExecutionError),
    /// Completed, but nothing chained afterwards may run
    Interrupted(ExecutionContext),
}

impl Outcome {
    pub fn context(&self) -> &ExecutionContext {
        match self {
            Self::Success(ctx) | Self::Interrupted(ctx) | Self::Failure(ctx, _) => ctx,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// An interruption is not an error.
    pub fn into_result(self) -> Result<ExecutionContext, ExecutionError> {
        match self {
            Self::Success(ctx) | Self::Interrupted(ctx) => Ok(ctx),
            Self::Failure(_, err) => Err(err),
        }
    }
}

type Body = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A composable asynchronous step.
///
/// Cloning shares the underlying body; an executable can be run any number
/// of times, once per execution.
#[derive(Clone)]
pub struct Executable {
    body: Body,
}

impl Executable {
    /// Wraps an async function as an executable.
    ///
    /// On error the context the step received is handed on with the error.
    pub fn new<F, Fut>(step: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionContext, ExecutionError>> + Send + 'static,
    {
        let step = Arc::new(step);
        Self::from_outcome(move |ctx| {
            let step = Arc::clone(&step);
            async move {
                let fallback = ctx.clone();
                match step(ctx).await {
                    Ok(ctx) => Outcome::Success(ctx),
                    Err(err) => Outcome::Failure(fallback, err),
                }
            }
        })
    }

    /// Wraps an async function that decides its own outcome.
    pub fn from_outcome<F, Fut>(step: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self {
            body: Arc::new(move |ctx| step(ctx).boxed()),
        }
    }

    /// An executable passing the context through unchanged.
    pub fn identity() -> Self {
        Self::new(|ctx| async move { Ok(ctx) })
    }

    /// Publishes the event built from the context.
    pub fn send_event<F>(event: F) -> Self
    where
        F: Fn(&ExecutionContext) -> ExecutionEvent + Send + Sync + 'static,
    {
        let event = Arc::new(event);
        Self::new(move |ctx| {
            let event = Arc::clone(&event);
            async move {
                match ctx.send_event(event(&ctx)) {
                    Ok(()) => Ok(ctx),
                    Err(err) => Err(ExecutionError::Event(err)),
                }
            }
        })
    }

    /// Runs this executable, resolving to its outcome.
    pub fn run(&self, ctx: ExecutionContext) -> BoxFuture<'static, Outcome> {
        (self.body)(ctx)
    }

    /// Runs this executable, resolving to the final context or the error.
    pub async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionContext, ExecutionError> {
        self.run(ctx).await.into_result()
    }

    /// Runs `next` after this executable succeeded.
    ///
    /// A failure or an interruption skips `next` and is passed on as is.
    /// Cancellation is honoured here: a cancelled execution fails before
    /// `next` starts.
    pub fn and_then(&self, name: impl Into<String>, next: Executable) -> Self {
        let first = self.clone();
        let name: Arc<str> = Arc::from(name.into());
        Self::from_outcome(move |ctx| {
            let first = first.clone();
            let next = next.clone();
            let name = Arc::clone(&name);
            async move {
                match first.run(ctx).await {
                    Outcome::Success(ctx) if ctx.is_cancelled() => {
                        info!(
                            "exec={} cancelled before step '{}'",
                            ctx.execution_id(),
                            name
                        );
                        Outcome::Failure(ctx, ExecutionError::Cancelled)
                    }
                    Outcome::Success(ctx) => {
                        debug!("exec={} step '{}'", ctx.execution_id(), name);
                        next.run(ctx).await
                    }
                    halted => halted,
                }
            }
        })
    }

    /// Recovers from a failure of this executable.
    ///
    /// The handler receives the context and the error; if it succeeds the
    /// chain continues normally, otherwise the composite stays failed.
    pub fn on_error<H, Fut>(&self, handler: H) -> Self
    where
        H: Fn(ExecutionContext, ExecutionError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionContext, ExecutionError>> + Send + 'static,
    {
        let inner = self.clone();
        let handler = Arc::new(handler);
        Self::from_outcome(move |ctx| {
            let inner = inner.clone();
            let handler = Arc::clone(&handler);
            async move {
                match inner.run(ctx).await {
                    Outcome::Failure(ctx, err) => {
                        warn!("exec={} recovering from: {}", ctx.execution_id(), err);
                        let fallback = ctx.clone();
                        match handler(ctx, err).await {
                            Ok(ctx) => Outcome::Success(ctx),
                            Err(err) => Outcome::Failure(fallback, err),
                        }
                    }
                    other => other,
                }
            }
        })
    }

    /// Recovers from a failure by running the executable built from the error.
    pub fn on_error_then<F>(&self, recovery: F) -> Self
    where
        F: Fn(&ExecutionError) -> Executable + Send + Sync + 'static,
    {
        let inner = self.clone();
        let recovery = Arc::new(recovery);
        Self::from_outcome(move |ctx| {
            let inner = inner.clone();
            let recovery = Arc::clone(&recovery);
            async move {
                match inner.run(ctx).await {
                    Outcome::Failure(ctx, err) => {
                        warn!("exec={} recovering from: {}", ctx.execution_id(), err);
                        recovery(&err).run(ctx).await
                    }
                    other => other,
                }
            }
        })
    }

    /// Halts the chain once this executable completed.
    ///
    /// A success becomes [`Outcome::Interrupted`]; a failure is left as is.
    pub fn interrupt(&self) -> Self {
        let inner = self.clone();
        Self::from_outcome(move |ctx| {
            let inner = inner.clone();
            async move {
                match inner.run(ctx).await {
                    Outcome::Success(ctx) => {
                        debug!("exec={} chain interrupted", ctx.execution_id());
                        Outcome::Interrupted(ctx)
                    }
                    other => other,
                }
            }
        })
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Executable")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::monitoring::EventRecorder;
    use crate::process::{ExecutionRef, PStep, StepStatus};

    type Trace = Arc<Mutex<Vec<String>>>;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionRef::generate(),
            "proc",
            "alice",
            Vec::new(),
            Arc::new(EventRecorder::new()),
        )
    }

    fn entries(trace: &Trace) -> Vec<String> {
        trace.lock().unwrap().clone()
    }

    fn record(trace: &Trace, label: &'static str) -> Executable {
        let trace = Arc::clone(trace);
        Executable::new(move |ctx| {
            trace.lock().unwrap().push(label.to_string());
            async move { Ok(ctx) }
        })
    }

    fn failing(trace: &Trace, label: &'static str) -> Executable {
        let trace = Arc::clone(trace);
        Executable::new(move |_ctx| {
            trace.lock().unwrap().push(label.to_string());
            async move { Err(ExecutionError::step(label, "boom")) }
        })
    }

    type Recovered = futures::future::Ready<Result<ExecutionContext, ExecutionError>>;

    fn recover(trace: &Trace) -> impl Fn(ExecutionContext, ExecutionError) -> Recovered {
        let trace = Arc::clone(trace);
        move |ctx, _err| {
            let mut trace = trace.lock().unwrap();
            trace.push("error".to_string());
            trace.push("recover".to_string());
            futures::future::ready(Ok(ctx))
        }
    }

    #[tokio::test]
    async fn test_and_then_runs_in_order() {
        let trace = Trace::default();
        let chain = record(&trace, "a")
            .and_then("b", record(&trace, "b"))
            .and_then("c", record(&trace, "c"));

        assert!(chain.execute(context()).await.is_ok());
        assert_eq!(entries(&trace), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_and_then_is_associative() {
        let left = Trace::default();
        let right = Trace::default();

        let nested_left = record(&left, "a")
            .and_then("b", record(&left, "b"))
            .and_then("c", record(&left, "c"));
        let nested_right = record(&right, "a").and_then(
            "bc",
            record(&right, "b").and_then("c", record(&right, "c")),
        );

        nested_left.execute(context()).await.unwrap();
        nested_right.execute(context()).await.unwrap();
        assert_eq!(entries(&left), entries(&right));
    }

    #[tokio::test]
    async fn test_failure_skips_continuation() {
        let trace = Trace::default();
        let chain = record(&trace, "a")
            .and_then("b", failing(&trace, "b"))
            .and_then("c", record(&trace, "c"));

        let result = chain.execute(context()).await;
        assert!(matches!(result, Err(ExecutionError::StepFailed { .. })));
        assert_eq!(entries(&trace), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_on_error_recovers_downstream() {
        let trace = Trace::default();
        let chain = record(&trace, "a")
            .and_then("b", failing(&trace, "b"))
            .on_error(recover(&trace))
            .and_then("c", record(&trace, "c"));

        assert!(chain.execute(context()).await.is_ok());
        assert_eq!(entries(&trace), vec!["a", "b", "error", "recover", "c"]);
    }

    #[tokio::test]
    async fn test_on_error_upstream_of_failure_has_no_effect() {
        let trace = Trace::default();
        let chain = record(&trace, "a")
            .on_error(recover(&trace))
            .and_then("b", failing(&trace, "b"))
            .and_then("c", record(&trace, "c"));

        assert!(chain.execute(context()).await.is_err());
        assert_eq!(entries(&trace), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_handler_keeps_chain_failed() {
        let trace = Trace::default();
        let chain = failing(&trace, "a")
            .on_error(|_ctx, err| async move {
                Err(ExecutionError::step("handler", err.to_string()))
            })
            .and_then("c", record(&trace, "c"));

        match chain.execute(context()).await {
            Err(ExecutionError::StepFailed { step, .. }) => assert_eq!(step, "handler"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(entries(&trace), vec!["a"]);
    }

    #[tokio::test]
    async fn test_interrupt_halts_chain() {
        let trace = Trace::default();
        let chain = record(&trace, "a")
            .and_then("b", record(&trace, "b"))
            .interrupt()
            .and_then("c", record(&trace, "c"));

        let outcome = chain.run(context()).await;
        assert!(matches!(outcome, Outcome::Interrupted(_)));
        assert!(outcome.into_result().is_ok());
        assert_eq!(entries(&trace), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_failure() {
        let trace = Trace::default();
        let chain = failing(&trace, "a")
            .interrupt()
            .on_error(recover(&trace))
            .and_then("c", record(&trace, "c"));

        assert!(chain.execute(context()).await.is_ok());
        assert_eq!(entries(&trace), vec!["a", "error", "recover", "c"]);
    }

    #[tokio::test]
    async fn test_cancellation_checked_between_steps() {
        let trace = Trace::default();
        let cancel_after_a = {
            let trace = Arc::clone(&trace);
            Executable::new(move |ctx: ExecutionContext| {
                trace.lock().unwrap().push("a".to_string());
                ctx.cancellation().cancel();
                async move { Ok(ctx) }
            })
        };
        let chain = cancel_after_a.and_then("b", record(&trace, "b"));

        let result = chain.execute(context()).await;
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert_eq!(entries(&trace), vec!["a"]);
    }

    #[tokio::test]
    async fn test_on_error_then_runs_recovery_executable() {
        let trace = Trace::default();
        let recovery_trace = Arc::clone(&trace);
        let chain = failing(&trace, "a").on_error_then(move |err| {
            recovery_trace.lock().unwrap().push(format!("handled {}", err));
            Executable::send_event(|_| ExecutionEvent::failure("a failed"))
        });

        let ctx = context();
        let sink = ctx.events().clone();
        assert!(chain.execute(ctx).await.is_ok());
        assert_eq!(sink.terminal_status(), Some(StepStatus::Failure));
        assert_eq!(entries(&trace)[1], "handled step 'a' failed: boom");
    }

    #[tokio::test]
    async fn test_send_event_after_final_fails() {
        let chain = Executable::send_event(|_| ExecutionEvent::success("done", vec![]))
            .and_then(
                "progress",
                Executable::send_event(|_| ExecutionEvent::from_step(PStep::running("late"))),
            );

        let result = chain.execute(context()).await;
        assert!(matches!(
            result,
            Err(ExecutionError::Event(EventError::AlreadyTerminated(_)))
        ));
    }

    #[tokio::test]
    async fn test_identity_passes_context() {
        let ctx = context();
        let id = ctx.execution_id();
        let ctx = Executable::identity().execute(ctx).await.unwrap();
        assert_eq!(ctx.execution_id(), id);
    }
}
