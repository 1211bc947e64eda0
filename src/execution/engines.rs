//! Built-in Engines
//!
//! - [`TokioEngine`]: one task per execution, bounded by a semaphore
//! - [`QueuedEngine`]: a fixed pool of workers fed by a bounded queue

use std::sync::Arc;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex, Semaphore};

use super::engine::{drive, reject, EngineSetupError, ExecutionHandle, WorkloadEngine};
use super::executable::Executable;
use crate::process::{ExecutionContext, StepStatus};

/// Spawns one task per execution on the current tokio runtime.
///
/// At most `capacity` executions are driven at once; the others wait for a
/// permit inside their task.
#[derive(Debug)]
pub struct TokioEngine {
    permits: Arc<Semaphore>,
}

impl TokioEngine {
    pub const NAME: &'static str = "tokio";

    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Stops admitting executions; waiting and new ones fail.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl WorkloadEngine for TokioEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, executable: Executable, ctx: ExecutionContext) -> ExecutionHandle {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                let status = reject(&ctx, Self::NAME, e.to_string());
                return ExecutionHandle::finished(&ctx, status);
            }
        };

        let (handle, done) = ExecutionHandle::pending(&ctx);
        let permits = Arc::clone(&self.permits);

        runtime.spawn(async move {
            let status = match permits.acquire_owned().await {
                Ok(_permit) => drive(executable, ctx).await,
                Err(_) => reject(&ctx, Self::NAME, "engine is closed"),
            };
            let _ = done.send(status);
        });

        handle
    }
}

struct Job {
    executable: Executable,
    ctx: ExecutionContext,
    done: oneshot::Sender<StepStatus>,
}

/// Drives executions on a fixed number of workers.
///
/// Executions wait in a bounded queue; when it is full the execution is
/// rejected right away instead of waiting.
#[derive(Debug)]
pub struct QueuedEngine {
    queue: mpsc::Sender<Job>,
    workers: usize,
}

impl QueuedEngine {
    pub const NAME: &'static str = "queued";

    /// Starts `workers` workers on the current runtime.
    pub fn start(workers: usize, capacity: usize) -> Result<Self, EngineSetupError> {
        let runtime =
            Handle::try_current().map_err(|_| EngineSetupError::NoRuntime(Self::NAME.to_string()))?;
        let workers = workers.max(1);
        let (queue, receiver) = mpsc::channel::<Job>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..workers {
            let receiver = Arc::clone(&receiver);
            runtime.spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else { break };
                    let status = drive(job.executable, job.ctx).await;
                    let _ = job.done.send(status);
                }
                debug!("Queue worker {} stopped", worker);
            });
        }

        Ok(Self { queue, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl WorkloadEngine for QueuedEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, executable: Executable, ctx: ExecutionContext) -> ExecutionHandle {
        let (handle, done) = ExecutionHandle::pending(&ctx);
        let job = Job {
            executable,
            ctx,
            done,
        };

        if let Err(e) = self.queue.try_send(job) {
            let (job, reason) = match e {
                TrySendError::Full(job) => (job, "queue is full"),
                TrySendError::Closed(job) => (job, "queue is closed"),
            };
            warn!("exec={} rejected: {}", job.ctx.execution_id(), reason);
            let status = reject(&job.ctx, Self::NAME, reason);
            let _ = job.done.send(status);
        }

        handle
    }
}
