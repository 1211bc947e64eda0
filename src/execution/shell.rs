//! Shell Processes
//!
//! Runs a bash script inside an execution's workdir:
//! - Placeholder substitution (`{input}`, `{output}`)
//! - Script generation with `set -e`
//! - Environment variables from the process configuration and parameters
//! - Output capture and error reporting

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use serde_json::Value;
use tokio::process::Command;

use super::executable::{Executable, ExecutionError};
use super::workdir::Workdir;
use crate::process::ExecutionContext;

/// Name of the generated script inside the workdir.
const SCRIPT_NAME: &str = "run.sh";

/// Parses `KEY=VALUE&KEY2=VALUE2` into variable pairs.
///
/// Empty segments are ignored; a segment without `=` or with an empty key
/// is an error.
pub fn parse_env_spec(spec: &str) -> Result<Vec<(String, String)>, String> {
    spec.split('&')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("invalid environment entry '{}'", segment)),
        })
        .collect()
}

/// A bash script run against the files of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProcess {
    script: String,
    env: Vec<(String, String)>,
}

impl ShellProcess {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// The step running the script. Requires a prepared workdir.
    pub fn executable(&self) -> Executable {
        let process = Arc::new(self.clone());
        Executable::new(move |ctx: ExecutionContext| {
            let process = Arc::clone(&process);
            async move {
                let workdir = ctx
                    .workdir()
                    .cloned()
                    .ok_or_else(|| ExecutionError::step("script", "no workdir was prepared"))?;
                process.run_in(&workdir, &ctx).await?;
                Ok(ctx)
            }
        })
    }

    async fn run_in(&self, workdir: &Workdir, ctx: &ExecutionContext) -> Result<(), ExecutionError> {
        let inputs: Vec<PathBuf> = ctx
            .input_files()
            .iter()
            .map(|f| workdir.input_dir().join(&f.name))
            .collect();
        let command_text = render_command(&self.script, &inputs, &workdir.output_dir());
        let script_path = write_script(workdir.path(), &command_text).await?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path)
            .current_dir(workdir.path())
            .env("INPUT_DIR", workdir.input_dir())
            .env("OUTPUT_DIR", workdir.output_dir())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for (name, value) in ctx.parameters() {
            cmd.env(parameter_variable(name), parameter_text(value));
        }

        debug!(
            "exec={} running script in {}",
            ctx.execution_id(),
            workdir.path().display()
        );
        let output = cmd.output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            if !stdout.trim().is_empty() {
                debug!("exec={} output:\n{}", ctx.execution_id(), stdout);
            }
            return Ok(());
        }

        error!(
            "exec={} script failed with exit code: {:?}",
            ctx.execution_id(),
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }

        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(ExecutionError::step(
            "script",
            format!("exit code {}: {}", code, stderr.trim()),
        ))
    }
}

/// Resolves placeholders in the script text.
///
/// `{input}` / `{inputs}` become the space-separated input paths,
/// `{output}` / `{outputs}` the output directory. Each path is substituted
/// as a single-quoted shell word, so placeholders must not be quoted again
/// in the script.
fn render_command(script: &str, inputs: &[PathBuf], output_dir: &Path) -> String {
    let inputs_str = inputs
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    let output_str = shell_quote(output_dir);

    script
        .replace("{inputs}", &inputs_str)
        .replace("{input}", &inputs_str)
        .replace("{outputs}", &output_str)
        .replace("{output}", &output_str)
}

/// `it's here` -> `'it'\''s here'`
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

async fn write_script(dir: &Path, command_text: &str) -> std::io::Result<PathBuf> {
    let script_path = dir.join(SCRIPT_NAME);
    let content = format!("#!/bin/bash\nset -e\n{}\n", command_text);
    tokio::fs::write(&script_path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(script_path)
}

/// `level` -> `PARAM_LEVEL`
fn parameter_variable(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("PARAM_{}", normalized)
}

fn parameter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
