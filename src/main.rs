//! jobstage CLI
//!
//! Entry point for the `jobstage` command-line tool.

use clap::{Parser, Subcommand};
use jobstage::calcjob::CODE_LINK;
use jobstage::engine::JobHandle;
use jobstage::scheduler::JobResources;
use jobstage::{
    Engine, EngineConfig, FailureKind, InputValue, Inventory, JobFailure, JobOutcome, JobRequest,
    JobRunState, ParamValue,
};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobstage")]
#[command(about = "Stage, submit and retrieve calculation jobs", version)]
struct Cli {
    /// Engine configuration file (default: ~/.config/jobstage/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Inventory file (default: ~/.config/jobstage/inventory.toml)
    #[arg(long, short = 'i', global = true)]
    inventory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Computer management commands
    Computer {
        #[command(subcommand)]
        action: ComputerCommands,
    },

    /// Code management commands
    Code {
        #[command(subcommand)]
        action: CodeCommands,
    },

    /// Submit a job and wait for it to finish
    Submit {
        /// Plugin tag (e.g. arithmetic.add)
        plugin: String,

        /// Computer to run on
        #[arg(long)]
        computer: String,

        /// Code label, label@computer or UUID
        #[arg(long)]
        code: String,

        /// Inputs as key=value (repeatable)
        #[arg(long = "input", short = 'x')]
        inputs: Vec<String>,

        /// User whose AuthInfo is used (default: $USER)
        #[arg(long, short = 'u')]
        user: Option<String>,

        /// Job id (default: a fresh UUID)
        #[arg(long)]
        job_id: Option<String>,

        #[arg(long)]
        num_machines: Option<u32>,

        #[arg(long)]
        mpiprocs_per_machine: Option<u32>,

        /// Wallclock limit in seconds
        #[arg(long)]
        walltime: Option<u64>,

        #[arg(long)]
        queue: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted state of a job
    Status {
        job_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List stored jobs
    Jobs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Continue polling a job from its record, without resubmitting
    Resume {
        job_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Cancel a job from its record
    Cancel {
        job_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ComputerCommands {
    /// List configured computers
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Open and close a session to check connectivity
    Test {
        name: String,

        #[arg(long, short = 'u')]
        user: Option<String>,
    },

    /// Set the AuthInfo of a user on a computer
    Configure {
        name: String,

        #[arg(long, short = 'u')]
        user: Option<String>,

        /// Transport parameters as key=value (repeatable)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CodeCommands {
    /// List registered codes
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("JOBSTAGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let inventory_path = cli.inventory.unwrap_or_else(Inventory::default_path);
    let engine = load_engine(cli.config, &inventory_path);

    match cli.command {
        Commands::Computer { action } => match action {
            ComputerCommands::List { json } => run_computer_list(&engine, json),
            ComputerCommands::Test { name, user } => run_computer_test(&engine, &name, &user_or_env(user)),
            ComputerCommands::Configure { name, user, params } => {
                run_computer_configure(engine, &inventory_path, &name, &user_or_env(user), &params)
            }
        },
        Commands::Code { action } => match action {
            CodeCommands::List { json } => run_code_list(&engine, json),
        },
        Commands::Submit {
            plugin,
            computer,
            code,
            inputs,
            user,
            job_id,
            num_machines,
            mpiprocs_per_machine,
            walltime,
            queue,
            account,
            json,
        } => {
            let resources = JobResources {
                num_machines,
                num_mpiprocs_per_machine: mpiprocs_per_machine,
                max_wallclock_seconds: walltime,
                queue_name: queue,
                account,
            };
            let mut request = JobRequest::new(plugin, computer, user_or_env(user), BTreeMap::new());
            if let Some(id) = job_id {
                request.job_id = id;
            }
            if resources != JobResources::default() {
                request.resources = Some(resources);
            }
            run_submit(&engine, request, &code, &inputs, json)
        }
        Commands::Status { job_id, json } => run_status(&engine, &job_id, json),
        Commands::Jobs { json } => run_jobs(&engine, json),
        Commands::Resume { job_id, json } => match engine.resume(&job_id) {
            Ok(handle) => finish_foreground(handle, json),
            Err(e) => exit_with(e.failure_kind(), e),
        },
        Commands::Cancel { job_id, json } => match engine.cancel_detached(&job_id) {
            Ok(record) => print_record(&record, json),
            Err(e) => exit_with(e.failure_kind(), e),
        },
    }
}

fn exit_with(kind: FailureKind, error: impl Display) -> ! {
    eprintln!("Error: {}", error);
    process::exit(kind.exit_code());
}

fn user_or_env(user: Option<String>) -> String {
    user.or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "default".to_string())
}

fn load_engine(config_path: Option<PathBuf>, inventory_path: &Path) -> Engine {
    let config_path = config_path.unwrap_or_else(EngineConfig::default_path);
    let config = EngineConfig::load(&config_path)
        .unwrap_or_else(|e| exit_with(FailureKind::Configuration, e));
    let inventory = Inventory::load_or_default(inventory_path)
        .unwrap_or_else(|e| exit_with(FailureKind::Configuration, e));
    Engine::from_inventory(config, inventory).unwrap_or_else(|e| exit_with(e.failure_kind(), e))
}

/// `key=value` pairs from the command line
fn parse_pairs<T>(pairs: &[String], parse: impl Fn(&str) -> T) -> BTreeMap<String, T> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => (key.to_string(), parse(value)),
            _ => exit_with(
                FailureKind::InputValidation,
                format!("expected key=value, got '{}'", pair),
            ),
        })
        .collect()
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => exit_with(FailureKind::Internal, e),
    }
}

fn run_computer_list(engine: &Engine, json_output: bool) {
    let computers: Vec<_> = engine.registries().computers.iter().collect();
    if json_output {
        match serde_json::to_value(&computers) {
            Ok(value) => print_json(&value),
            Err(e) => exit_with(FailureKind::Internal, e),
        }
        return;
    }
    if computers.is_empty() {
        println!("No computers configured.");
        return;
    }
    println!("Configured computers ({} total):\n", computers.len());
    for computer in computers {
        let users: Vec<&str> = engine
            .registries()
            .authinfos
            .iter()
            .filter(|a| a.computer == computer.name)
            .map(|a| a.user.as_str())
            .collect();
        println!(
            "  {} ({}){}",
            computer.name,
            computer.hostname,
            if computer.enabled { "" } else { " [disabled]" }
        );
        println!("    Transport: {}  Scheduler: {}", computer.transport, computer.scheduler);
        println!("    Workdir: {}", computer.workdir);
        if !users.is_empty() {
            println!("    Configured users: {}", users.join(", "));
        }
        println!();
    }
}

fn run_computer_test(engine: &Engine, name: &str, user: &str) {
    eprintln!("Testing connection to '{}' as '{}'...", name, user);
    match engine.test_computer(name, user) {
        Ok(()) => println!("Connection to '{}' OK", name),
        Err(e) => exit_with(e.failure_kind(), e),
    }
}

fn run_computer_configure(
    mut engine: Engine,
    inventory_path: &Path,
    name: &str,
    user: &str,
    params: &[String],
) {
    let params = parse_pairs(params, ParamValue::parse_loose);
    let keys: Vec<String> = params.keys().cloned().collect();
    if let Err(e) = engine.configure(name, user, params) {
        exit_with(e.failure_kind(), e);
    }
    if let Err(e) = engine.inventory().save(inventory_path) {
        exit_with(FailureKind::Configuration, e);
    }
    println!(
        "Configured '{}' for user '{}' (parameters: {})",
        name,
        user,
        if keys.is_empty() { "none".to_string() } else { keys.join(", ") }
    );
}

fn run_code_list(engine: &Engine, json_output: bool) {
    let codes: Vec<_> = engine.registries().codes.iter().collect();
    if json_output {
        match serde_json::to_value(&codes) {
            Ok(value) => print_json(&value),
            Err(e) => exit_with(FailureKind::Internal, e),
        }
        return;
    }
    if codes.is_empty() {
        println!("No codes registered.");
        return;
    }
    for code in codes {
        println!("  {}  {}", code.uuid, code.full_label());
        println!("    Executable: {}", code.executable.display());
        if code.withmpi {
            println!("    MPI: yes");
        }
    }
}

fn run_submit(engine: &Engine, mut request: JobRequest, code_ref: &str, inputs: &[String], json_output: bool) {
    let code = engine
        .registries()
        .codes
        .lookup(code_ref)
        .unwrap_or_else(|| exit_with(FailureKind::Configuration, format!("unknown code '{}'", code_ref)));
    request.inputs = parse_pairs(inputs, InputValue::parse_loose);
    request.inputs.insert(CODE_LINK.to_string(), InputValue::Code(code.uuid));

    match engine.submit(request) {
        Ok(handle) => {
            eprintln!("Submitted job {}", handle.job_id());
            finish_foreground(handle, json_output);
        }
        Err(e) => exit_with(e.failure_kind(), e),
    }
}

/// Wait for a job, cancelling it on Ctrl-C
fn finish_foreground(handle: JobHandle, json_output: bool) {
    let token = handle.cancellation();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Cancelling...");
        token.cancel();
    }) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }

    match handle.wait() {
        Ok(outcome) => print_outcome(&outcome, json_output),
        Err(failure) => {
            print_failure(&failure, json_output);
            process::exit(failure.failure_kind().exit_code());
        }
    }
}

fn print_outcome(outcome: &JobOutcome, json_output: bool) {
    if json_output {
        print_json(&serde_json::json!({
            "job_id": outcome.job_id,
            "state": "COMPLETED",
            "remote_id": outcome.remote_id,
            "exit_code": outcome.exit_code,
            "retrieved": outcome.retrieved,
        }));
        return;
    }
    println!("Job {} completed", outcome.job_id);
    if let Some(ref id) = outcome.remote_id {
        println!("  Remote id: {}", id);
    }
    for file in &outcome.retrieved {
        println!("  Retrieved: {}", file.path.display());
    }
}

fn print_failure(failure: &JobFailure, json_output: bool) {
    if json_output {
        print_json(&serde_json::json!({
            "job_id": failure.job_id,
            "state": "FAILED",
            "kind": failure.failure_kind(),
            "error": failure.error.to_string(),
            "remote_id": failure.remote_id,
            "exit_code": failure.exit_code,
            "retrieved": failure.retrieved,
        }));
        return;
    }
    eprintln!("Job {} failed: {}", failure.job_id, failure.error);
    if let Some(ref id) = failure.remote_id {
        eprintln!("  Remote id: {}", id);
    }
}

fn print_record(record: &JobRunState, json_output: bool) {
    if json_output {
        match record.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => exit_with(FailureKind::Internal, e),
        }
        return;
    }
    println!("Job {} ({})", record.job_id, record.plugin);
    println!("  State: {:?}", record.state);
    println!("  Computer: {}  User: {}", record.computer, record.user);
    if let Some(ref id) = record.remote_id {
        println!("  Remote id: {}", id);
    }
    if let Some(ref dir) = record.remote_workdir {
        println!("  Remote directory: {}", dir.display());
    }
    if let Some(ref status) = record.last_status {
        println!("  Last status: {:?}", status);
    }
    if let Some(ref failure) = record.failure {
        println!("  Failure: {:?} {}", failure.kind, failure.message);
    }
}

fn run_status(engine: &Engine, job_id: &str, json_output: bool) {
    match engine.status(job_id) {
        Ok(record) => print_record(&record, json_output),
        Err(e) => exit_with(e.failure_kind(), e),
    }
}

fn run_jobs(engine: &Engine, json_output: bool) {
    let jobs = engine.jobs().unwrap_or_else(|e| exit_with(e.failure_kind(), e));
    if json_output {
        match serde_json::to_value(&jobs) {
            Ok(value) => print_json(&value),
            Err(e) => exit_with(FailureKind::Internal, e),
        }
        return;
    }
    if jobs.is_empty() {
        println!("No jobs recorded.");
        return;
    }
    for job in jobs {
        let state = format!("{:?}", job.state);
        println!("  {}  {:<10}  {}  {}", job.job_id, state, job.computer, job.plugin);
    }
}
