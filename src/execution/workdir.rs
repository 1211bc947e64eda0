//! Execution Working Directories
//!
//! Every execution of a file-based process gets its own directory under the
//! workdir root, with an `input/` directory holding copies of its inputs and
//! an `output/` directory the process writes to. Outputs are moved to the
//! storage root once the process succeeded.
//!
//! # Root Resolution
//!
//! Both roots are resolved once, in the following order:
//! 1. Environment: `PROCRUNNER_WORKDIR` / `PROCRUNNER_STORAGE`
//! 2. Default: `{tmp}/procrunner/workdirs` / `{tmp}/procrunner/storage`

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use uuid::Uuid;

use super::executable::{Executable, ExecutionError};
use crate::process::{ExecutionContext, ExecutionEvent, InputFile, OutputFile, PStep};

/// Lazily-resolved root under which execution workdirs are created.
pub static WORKDIR_ROOT: Lazy<PathBuf> =
    Lazy::new(|| resolve_root("PROCRUNNER_WORKDIR", "workdirs"));

/// Lazily-resolved root where produced files are stored.
pub static STORAGE_ROOT: Lazy<PathBuf> =
    Lazy::new(|| resolve_root("PROCRUNNER_STORAGE", "storage"));

fn resolve_root(variable: &str, default_dir: &str) -> PathBuf {
    if let Ok(path) = std::env::var(variable) {
        if !path.trim().is_empty() {
            info!("Using {} root: {}", variable, path);
            return PathBuf::from(path);
        }
    }

    let path = std::env::temp_dir().join("procrunner").join(default_dir);
    info!("Using default {} root: {}", default_dir, path.display());
    path
}

/// Workdir and storage roots used by file-based processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkdirRoots {
    pub workdir: PathBuf,
    pub storage: PathBuf,
}

impl WorkdirRoots {
    pub fn new(workdir: impl Into<PathBuf>, storage: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            storage: storage.into(),
        }
    }

    /// Roots resolved from the environment.
    pub fn from_env() -> Self {
        Self::new(WORKDIR_ROOT.clone(), STORAGE_ROOT.clone())
    }

    /// Where the outputs of one execution are stored.
    pub fn storage_for(&self, execution_id: Uuid) -> PathBuf {
        self.storage.join(execution_id.to_string())
    }
}

impl Default for WorkdirRoots {
    fn default() -> Self {
        Self::from_env()
    }
}

/// The working directory of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    base: PathBuf,
}

impl Workdir {
    pub fn for_execution(root: &Path, execution_id: Uuid) -> Self {
        Self {
            base: root.join(execution_id.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    pub fn input_dir(&self) -> PathBuf {
        self.base.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base.join("output")
    }

    /// Creates the directory layout and copies the inputs into `input/`.
    pub async fn prepare(&self, inputs: &[InputFile]) -> io::Result<Vec<PathBuf>> {
        let input_dir = self.input_dir();
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(self.output_dir()).await?;

        let mut copied = Vec::with_capacity(inputs.len());
        for input in inputs {
            let target = input_dir.join(&input.name);
            tokio::fs::copy(&input.path, &target).await?;
            debug!("Copied input {} to {}", input.path.display(), target.display());
            copied.push(target);
        }
        Ok(copied)
    }

    /// Lists the regular files in `output/` with their sizes, sorted by name.
    pub async fn list_outputs(&self) -> io::Result<Vec<(String, PathBuf, u64)>> {
        let mut outputs = Vec::new();
        let mut entries = tokio::fs::read_dir(self.output_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                outputs.push((name, entry.path(), metadata.len()));
            }
        }
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(outputs)
    }

    /// Removes the whole directory.
    pub async fn clean(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.base).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Creates the execution's workdir and copies its inputs.
pub fn prepare_workdir(roots: WorkdirRoots) -> Executable {
    Executable::new(move |ctx: ExecutionContext| {
        let workdir = Workdir::for_execution(&roots.workdir, ctx.execution_id());
        async move {
            ctx.track_workdir(&workdir);
            if let Err(e) = workdir.prepare(ctx.input_files()).await {
                match workdir.clean().await {
                    Ok(()) => ctx.untrack_workdir(&workdir),
                    Err(clean_err) => {
                        warn!("Failed to remove {}: {}", workdir.path().display(), clean_err)
                    }
                }
                return Err(e.into());
            }
            debug!(
                "exec={} workdir ready at {}",
                ctx.execution_id(),
                workdir.path().display()
            );
            Ok(ctx.with_workdir(workdir))
        }
    })
}

/// Moves produced files to storage and reports them in a SUCCESS event.
pub fn store_outputs(roots: WorkdirRoots) -> Executable {
    Executable::new(move |ctx: ExecutionContext| {
        let storage = roots.storage_for(ctx.execution_id());
        async move {
            let workdir = ctx
                .workdir()
                .cloned()
                .ok_or_else(|| ExecutionError::step("store", "no workdir was prepared"))?;

            tokio::fs::create_dir_all(&storage).await?;
            let input_names: Vec<String> =
                ctx.input_files().iter().map(|f| f.name.clone()).collect();

            let mut files = Vec::new();
            for (name, path, size_bytes) in workdir.list_outputs().await? {
                let stored = storage.join(&name);
                tokio::fs::copy(&path, &stored).await?;
                files.push(OutputFile {
                    name,
                    path: stored,
                    size_bytes,
                    inputs: input_names.clone(),
                });
            }

            info!(
                "exec={} stored {} output file(s) in {}",
                ctx.execution_id(),
                files.len(),
                storage.display()
            );
            ctx.send_event(ExecutionEvent::success("outputs stored", files.clone()))?;
            Ok(ctx.with_output_files(files))
        }
    })
}

/// Removes the execution's workdir, if any.
pub fn clean_workdir() -> Executable {
    Executable::new(|ctx: ExecutionContext| async move {
        if let Some(workdir) = ctx.workdir() {
            workdir.clean().await?;
            ctx.untrack_workdir(workdir);
        }
        Ok(ctx.without_workdir())
    })
}

/// Reports a failure unless a final event was already sent, then cleans up.
fn fail_and_clean(message: String) -> Executable {
    Executable::new(move |ctx: ExecutionContext| {
        let message = message.clone();
        async move {
            if let Err(e) = ctx.send_event(ExecutionEvent::failure(message)) {
                warn!("exec={} failure not reported: {}", ctx.execution_id(), e);
            }
            if let Some(workdir) = ctx.workdir() {
                workdir.clean().await?;
                ctx.untrack_workdir(workdir);
            }
            Ok(ctx.without_workdir())
        }
    })
}

/// Runs `core` inside a fresh workdir.
///
/// The pipeline reports PREPARE, copies the inputs, reports RUNNING, runs
/// `core`, stores what it wrote to `output/` and cleans up. Any failure
/// reports FAILURE and still cleans up. The workdir is tracked on the
/// context, so [`drive`](super::drive) removes it when the pipeline is
/// abandoned by a timeout or a panic.
pub fn in_workdir(core_name: &str, core: Executable, roots: WorkdirRoots) -> Executable {
    Executable::send_event(|_| ExecutionEvent::from_step(PStep::prepare("preparing workdir")))
        .and_then("prepare", prepare_workdir(roots.clone()))
        .and_then(
            "running",
            Executable::send_event(|ctx| {
                ExecutionEvent::from_step(PStep::running(format!("running {}", ctx.process_name())))
            }),
        )
        .and_then(core_name, core)
        .and_then("store", store_outputs(roots))
        .and_then("clean", clean_workdir())
        .on_error_then(|err| fail_and_clean(err.to_string()))
}
