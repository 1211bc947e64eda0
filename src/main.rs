//! ProcRunner CLI Entry Point
//!
//! Runs one process of a catalog over a set of input files.
//!
//! # Usage
//!
//! ```bash
//! # List the processes of a catalog
//! procrunner --list catalog.yaml
//!
//! # Run a process over two files
//! procrunner catalog.yaml uppercase a.txt b.txt
//!
//! # Pass parameters and a timeout
//! procrunner catalog.yaml grep data.txt --param pattern=ERROR --timeout 60
//! ```

use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use procrunner::execution::{register_default_engines, EngineRegistry, WorkdirRoots};
use procrunner::process::{
    ChannelPublisher, ExecutionContext, ExecutionEvent, ExecutionRef, InputFile, PublishedEvent,
};
use procrunner::quota::{Admission, AdmissionController};
use procrunner::registry::{
    register_builtin_plugins, PluginRegistry, ProcessRegistry, YamlDefinitionStore,
};
use procrunner::{ExecutionHandle, PProcess, StepStatus, APP_NAME, VERSION};

/// Exit code when admission control refuses the execution.
const EXIT_REFUSED: u8 = 3;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    catalog_path: Option<PathBuf>,
    process: Option<String>,
    inputs: Vec<PathBuf>,
    list: bool,
    user: String,
    role: String,
    tenant: String,
    dataset: String,
    params: Vec<(String, String)>,
    timeout: Option<Duration>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_path: None,
            process: None,
            inputs: Vec::new(),
            list: false,
            user: env::var("USER").unwrap_or_else(|_| "anonymous".to_string()),
            role: "user".to_string(),
            tenant: "default".to_string(),
            dataset: "default".to_string(),
            params: Vec::new(),
            timeout: None,
            verbose: false,
        }
    }
}

/// How a run ended, mapped to the process exit code.
enum RunResult {
    Completed(StepStatus),
    Refused,
    Listed,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Asynchronous Process Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: procrunner [OPTIONS] <CATALOG> <PROCESS> [INPUT_FILE...]");
    println!("       procrunner --list <CATALOG>");
    println!();
    println!("Arguments:");
    println!("  <CATALOG>           Path to the process catalog (YAML)");
    println!("  <PROCESS>           Name of the process to run");
    println!("  [INPUT_FILE...]     Files given to the process");
    println!();
    println!("Options:");
    println!("  --list              List the processes of the catalog");
    println!("  --user NAME         User running the process (default: $USER)");
    println!("  --role ROLE         Role of the user (default: user)");
    println!("  --tenant TENANT     Tenant of the user (default: default)");
    println!("  --dataset NAME      Dataset of the input files (default: default)");
    println!("  --param KEY=VALUE   Process parameter, VALUE parsed as JSON when possible");
    println!("  --timeout SECS      Fail the execution after SECS seconds");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Environment:");
    println!("  PROCRUNNER_WORKDIR  Root of per-execution working directories");
    println!("  PROCRUNNER_STORAGE  Root where outputs are stored");
    println!();
    println!("Examples:");
    println!("  procrunner --list demos/catalog.yaml");
    println!("  procrunner demos/catalog.yaml uppercase notes.txt");
    println!("  procrunner demos/catalog.yaml grep app.log --param pattern=ERROR");
}

/// Returns the value following option `name`.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--list" | "-l" => config.list = true,
            "--verbose" | "-v" => config.verbose = true,
            "--user" => config.user = option_value(args, &mut i, "--user")?.to_string(),
            "--role" => config.role = option_value(args, &mut i, "--role")?.to_string(),
            "--tenant" => config.tenant = option_value(args, &mut i, "--tenant")?.to_string(),
            "--dataset" => config.dataset = option_value(args, &mut i, "--dataset")?.to_string(),
            "--param" => {
                let pair = option_value(args, &mut i, "--param")?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid parameter (expected KEY=VALUE): {}", pair))?;
                config.params.push((key.to_string(), value.to_string()));
            }
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
                config.timeout = Some(Duration::from_secs(secs));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.catalog_path.is_none() {
                    config.catalog_path = Some(PathBuf::from(arg));
                } else if config.process.is_none() {
                    config.process = Some(arg.clone());
                } else {
                    config.inputs.push(PathBuf::from(arg));
                }
            }
        }
        i += 1;
    }

    if config.catalog_path.is_none() {
        return Err("Missing catalog path".to_string());
    }
    if !config.list && config.process.is_none() {
        return Err("Missing process name".to_string());
    }

    Ok(config)
}

/// Parses `--param` values as JSON, falling back to plain strings.
fn parameter_values(params: &[(String, String)]) -> BTreeMap<String, Value> {
    params
        .iter()
        .map(|(key, raw)| {
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            (key.clone(), value)
        })
        .collect()
}

/// Reads the size of every input file.
async fn collect_inputs(
    paths: &[PathBuf],
    dataset: &str,
) -> Result<Vec<InputFile>, Box<dyn std::error::Error>> {
    let mut inputs = Vec::with_capacity(paths.len());

    for path in paths {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("Cannot read input '{}': {}", path.display(), e))?;
        if !metadata.is_file() {
            return Err(format!("Input is not a file: {}", path.display()).into());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| format!("Input has no file name: {}", path.display()))?;
        inputs.push(InputFile::new(name, path, metadata.len()).in_dataset(dataset));
    }

    Ok(inputs)
}

fn colored_status(status: StepStatus) -> String {
    match status {
        StepStatus::Prepare => status.as_str().cyan().to_string(),
        StepStatus::Running => status.as_str().yellow().to_string(),
        StepStatus::Success => status.as_str().green().bold().to_string(),
        StepStatus::Failure => status.as_str().red().bold().to_string(),
    }
}

/// Prints events as they are published, until every sender is gone.
fn spawn_event_printer(mut events: UnboundedReceiver<PublishedEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(published) = events.recv().await {
            let time = published
                .event
                .step()
                .map(|step| step.time.format("%H:%M:%S").to_string())
                .unwrap_or_default();

            match &published.event {
                ExecutionEvent::Intermediary(event) => {
                    let step = event.step();
                    println!("  {} {:<8} {}", time, colored_status(step.status), step.message);
                }
                ExecutionEvent::Final(event) => {
                    let step = event.step();
                    println!("  {} {:<8} {}", time, colored_status(step.status), step.message);
                    for file in event.output_files() {
                        println!("      -> {} ({} bytes)", file.path.display(), file.size_bytes);
                    }
                }
                ExecutionEvent::OutputFiles { output_files } => {
                    for file in output_files {
                        println!("      +  {} ({} bytes)", file.path.display(), file.size_bytes);
                    }
                }
            }
        }
    })
}

fn print_process(process: &PProcess) {
    let forecast = |f: Option<String>| f.unwrap_or_else(|| "-".to_string());

    println!(
        "  {:<20} plugin={:<8} engine={:<8} size={:<8} duration={}",
        process.name().bold(),
        process.plugin(),
        process.engine().name(),
        forecast(process.size_forecast().map(|f| f.format())),
        forecast(process.duration_forecast().map(|f| f.format())),
    );
    for parameter in process.parameters() {
        let optional = if parameter.optional { " (optional)" } else { "" };
        println!(
            "      --param {}=<{}>{}  {}",
            parameter.name, parameter.kind, optional, parameter.description
        );
    }
}

async fn list_processes(registry: &ProcessRegistry) -> Result<RunResult, Box<dyn std::error::Error>> {
    let report = registry.find_all().await?;

    println!("Processes:");
    for process in &report.processes {
        print_process(process);
    }

    if !report.skipped.is_empty() {
        println!();
        println!("Skipped:");
        for skipped in &report.skipped {
            println!("  {:<20} {}", skipped.name.red(), skipped.error);
        }
    }
    println!();

    Ok(RunResult::Listed)
}

/// Waits for an execution, cancelling it when `interrupt` resolves.
///
/// The pipeline then stops at its next safe point. A second interrupt
/// stops waiting and reports FAILURE.
async fn wait_interruptible<F, Fut>(handle: ExecutionHandle, mut interrupt: F) -> StepStatus
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let cancellation = handle.cancellation();
    let wait = handle.wait();
    tokio::pin!(wait);

    tokio::select! {
        status = &mut wait => return status,
        _ = interrupt() => {
            warn!("Interrupted, cancelling the execution (press Ctrl-C again to stop waiting)");
            cancellation.cancel();
        }
    }

    tokio::select! {
        status = &mut wait => status,
        _ = interrupt() => {
            warn!("Interrupted again, the process did not complete");
            StepStatus::Failure
        }
    }
}

async fn run_process(
    registry: &ProcessRegistry,
    config: &Config,
    name: &str,
) -> Result<RunResult, Box<dyn std::error::Error>> {
    let process = registry.find_by_name(name).await?;
    debug!("Resolved {:?}", process);

    if !process.allows(&config.tenant, &config.role, &config.dataset) {
        return Err(format!(
            "Access to '{}' denied for tenant '{}', role '{}', dataset '{}'",
            name, config.tenant, config.role, config.dataset
        )
        .into());
    }

    let parameters = process.resolve_parameters(&parameter_values(&config.params))?;
    let inputs = collect_inputs(&config.inputs, &config.dataset).await?;
    let input_bytes: u64 = inputs.iter().map(|f| f.size_bytes).sum();

    if let Some(duration) = process.expected_duration(input_bytes) {
        info!("Expected duration: {:?}", duration);
    }

    let admissions = AdmissionController::new();
    let _permit = match admissions.admit(&config.user, &process, input_bytes) {
        Admission::Granted(permit) => permit,
        Admission::Denied(reason) => {
            warn!("Execution refused: {}", reason);
            return Ok(RunResult::Refused);
        }
    };

    let (publisher, events) = ChannelPublisher::new();
    let printer = spawn_event_printer(events);

    let mut ctx = ExecutionContext::new(
        ExecutionRef::generate(),
        process.name(),
        &config.user,
        inputs,
        Arc::new(publisher),
    )
    .with_parameters(parameters);
    if let Some(timeout) = config.timeout {
        ctx = ctx.with_timeout(timeout);
    }

    info!("exec={} starting '{}'", ctx.execution_id(), process.name());
    println!();

    let handle = process.launch(ctx);
    let status = wait_interruptible(handle, || async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    })
    .await;

    // The printer ends once the engine has dropped the context.
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Event printer still running at exit");
    }
    println!();

    Ok(RunResult::Completed(status))
}

async fn execute(config: Config) -> Result<RunResult, Box<dyn std::error::Error>> {
    let capacity = num_cpus::get();
    let mut engines = EngineRegistry::new();
    register_default_engines(&mut engines, capacity)?;
    info!("Engines: {} (capacity {})", engines.names().join(", "), capacity);

    let mut plugins = PluginRegistry::new();
    register_builtin_plugins(&mut plugins, WorkdirRoots::from_env())?;

    let catalog: &Path = config
        .catalog_path
        .as_deref()
        .ok_or("Missing catalog path")?;
    let store = Arc::new(YamlDefinitionStore::new(catalog));
    let registry = ProcessRegistry::new(store, engines, plugins);

    if config.list {
        return list_processes(&registry).await;
    }

    let name = config.process.clone().ok_or("Missing process name")?;
    run_process(&registry, &config, &name).await
}

/// Main application entry point.
fn run() -> Result<RunResult, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(config)).map_err(|e| {
        error!("{}", e);
        e
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(RunResult::Completed(StepStatus::Success)) | Ok(RunResult::Listed) => ExitCode::SUCCESS,
        Ok(RunResult::Completed(status)) => {
            eprintln!("Execution ended with {}", status);
            ExitCode::FAILURE
        }
        Ok(RunResult::Refused) => ExitCode::from(EXIT_REFUSED),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
