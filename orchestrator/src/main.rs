//! Orchestration supervisor CLI.
//!
//! Drives one orchestration (`.orchestrator/state/`) through its steps by
//! launching worker sessions and reacting to what they leave behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use orchestrator::clock::{Clock, SystemClock};
use orchestrator::core::validation::validate;
use orchestrator::exit_codes;
use orchestrator::io::config::load_config;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_orchestration};
use orchestrator::io::oracle::CommandOracle;
use orchestrator::io::process::is_pid_alive;
use orchestrator::io::runner_record::RunnerRecords;
use orchestrator::io::state_store::StateStore;
use orchestrator::io::watch::watch_orchestration;
use orchestrator::io::workflow::{CommandLauncher, FileWorkflowStore};
use orchestrator::logging;
use orchestrator::recovery::RecoveryAdapter;
use orchestrator::state::{Budget, ExecutionConfig, ExecutionStatus};
use orchestrator::supervisor::{LoopDeps, LoopStop, run_loop};

/// How often the file watcher polls for changes.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Supervisor for multi-step agent workflows"
)]
struct Cli {
    /// Project root containing `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` and fresh orchestration documents.
    Init {
        /// Orchestration id.
        id: String,
        /// Overwrite existing documents.
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        execution: ExecutionArgs,
    },
    /// Run the control loop until the orchestration stops.
    Run {
        /// Orchestration id, when the documents are too damaged to name it.
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the current step, execution status and recent decisions.
    Status,
    /// Check the documents against their schemas and cross-document rules.
    Validate,
    /// Remove runner records left behind by dead processes.
    Reconcile,
}

#[derive(Args, Debug)]
struct ExecutionArgs {
    /// Merge without waiting for a human.
    #[arg(long)]
    auto_merge: bool,
    /// Pause after each completed batch.
    #[arg(long)]
    pause_between_batches: bool,
    /// Disable automatic healing of failed batches.
    #[arg(long)]
    no_auto_heal: bool,
    #[arg(long, default_value_t = 2)]
    max_heal_attempts: u32,
    /// Spend ceiling in USD; 0 disables it.
    #[arg(long, default_value_t = 25.0)]
    budget: f64,
}

impl ExecutionArgs {
    fn to_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            auto_merge: self.auto_merge,
            pause_between_batches: self.pause_between_batches,
            auto_heal_enabled: !self.no_auto_heal,
            max_heal_attempts: self.max_heal_attempts,
            budget: Budget {
                max_total: self.budget,
            },
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = OrchestratorPaths::new(&cli.root);
    match cli.command {
        Command::Init {
            id,
            force,
            execution,
        } => cmd_init(&cli.root, id, force, &execution),
        Command::Run { id } => cmd_run(paths, id),
        Command::Status => cmd_status(&paths),
        Command::Validate => cmd_validate(&paths),
        Command::Reconcile => cmd_reconcile(&paths),
    }
}

fn cmd_init(root: &std::path::Path, id: String, force: bool, args: &ExecutionArgs) -> Result<i32> {
    let options = InitOptions {
        orchestration_id: id,
        execution: args.to_config(),
        force,
    };
    let paths = init_orchestration(root, &options, SystemClock.now())?;
    println!("{}", paths.state_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: OrchestratorPaths, id: Option<String>) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let orchestration_id = orchestration_id(
        id,
        &StateStore::new(&paths),
        &RunnerRecords::new(paths.runners_dir.clone()),
    )?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let workflows = FileWorkflowStore::new(paths.workflows_dir.clone());
    let launcher = CommandLauncher::new(
        workflows.clone(),
        orchestration_id.clone(),
        paths.root.clone(),
        config.worker.command.clone(),
        clock.clone(),
    );
    let recovery = RecoveryAdapter::new(
        Arc::new(CommandOracle::new(&config.oracle, paths.root.clone())),
        config.oracle.clone(),
        paths.resolve(&config.artifacts_dir),
        paths.resolve(&config.tasks_file),
    )?;
    let deps = LoopDeps::new(
        orchestration_id,
        paths,
        config,
        Arc::new(workflows),
        Arc::new(launcher),
        recovery,
        clock,
    );

    // Without the watcher the loop still wakes at every poll timeout.
    let _watcher = match watch_orchestration(
        &deps.paths,
        &deps.orchestration_id,
        deps.wakeups.clone(),
        WATCH_INTERVAL,
    ) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "file watcher unavailable, polling only");
            None
        }
    };

    let outcome = run_loop(&deps, |_| {})?;
    let code = match &outcome.stop {
        LoopStop::Completed => {
            println!("{}: completed", outcome.orchestration_id);
            exit_codes::OK
        }
        LoopStop::NeedsAttention { trigger, issue } => {
            println!(
                "{}: needs attention ({trigger:?}): {issue}",
                outcome.orchestration_id
            );
            exit_codes::NEEDS_ATTENTION
        }
        LoopStop::Failed { reason } => {
            println!(
                "{}: failed: {}",
                outcome.orchestration_id,
                reason.as_deref().unwrap_or("no reason recorded")
            );
            exit_codes::FAILED
        }
        LoopStop::Cancelled => {
            println!("{}: cancelled", outcome.orchestration_id);
            exit_codes::FAILED
        }
        LoopStop::MaxIterationsReached { max_iterations } => {
            println!(
                "{}: stopped after {max_iterations} iterations",
                outcome.orchestration_id
            );
            exit_codes::FAILED
        }
    };
    Ok(code)
}

/// The id to drive: the flag, then either document, then whatever survives
/// in damaged documents or backups, then the only runner record on disk.
///
/// The loop rebuilds damaged documents itself, so an unreadable pair is not
/// a reason to refuse.
fn orchestration_id(
    flag: Option<String>,
    store: &StateStore,
    runners: &RunnerRecords,
) -> Result<String> {
    if let Some(id) = flag {
        return Ok(id);
    }
    if let Ok(state) = store.read_state() {
        return Ok(state.orchestration_id);
    }
    if let Ok(execution) = store.read_execution() {
        return Ok(execution.orchestration_id);
    }
    if let Some(id) = store.salvage_orchestration_id() {
        warn!(orchestration_id = %id, "documents unreadable, using salvaged id");
        return Ok(id);
    }
    let records = runners.list().unwrap_or_default();
    if let [record] = records.as_slice() {
        warn!(orchestration_id = %record.orchestration_id, "documents unreadable, using runner record");
        return Ok(record.orchestration_id.clone());
    }
    bail!("no orchestration id survives in the documents; pass --id")
}

fn cmd_status(paths: &OrchestratorPaths) -> Result<i32> {
    let store = StateStore::new(paths);
    let (state, execution) = store.read()?;
    println!("orchestration: {}", state.orchestration_id);
    println!(
        "step: {} ({})",
        state.step.current.as_str(),
        state
            .step
            .status
            .map_or("unset".to_string(), |status| format!("{status:?}"))
    );
    println!("status: {:?}", execution.status);
    if execution.batches.total > 0 {
        println!(
            "batch: {} of {}",
            (execution.batches.current + 1).min(execution.batches.total),
            execution.batches.total
        );
    }
    if let Some(workflow_id) = &execution.workflow_id {
        println!("workflow: {workflow_id}");
    }
    if let Some(context) = &execution.recovery_context {
        println!("attention: {} ({:?})", context.issue, context.trigger);
        if let Some(suggested) = &context.suggested_action {
            println!("suggested: {suggested}");
        }
    }
    for entry in execution.decision_log.iter().rev().take(5) {
        println!("  {} {}: {}", entry.timestamp.to_rfc3339(), entry.action, entry.reason);
    }
    Ok(status_code(execution.status))
}

fn status_code(status: ExecutionStatus) -> i32 {
    match status {
        ExecutionStatus::NeedsAttention => exit_codes::NEEDS_ATTENTION,
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => exit_codes::FAILED,
        ExecutionStatus::Running
        | ExecutionStatus::Paused
        | ExecutionStatus::WaitingMerge
        | ExecutionStatus::WaitingUserGate
        | ExecutionStatus::Completed => exit_codes::OK,
    }
}

fn cmd_validate(paths: &OrchestratorPaths) -> Result<i32> {
    let (state, execution) = StateStore::new(paths).read()?;
    let issues = validate(&state, &execution);
    if issues.is_empty() {
        return Ok(exit_codes::OK);
    }
    for issue in &issues {
        let note = if issue.is_repairable() {
            "repairable"
        } else {
            "needs recovery"
        };
        eprintln!("- {issue} ({note})");
    }
    bail!("{} consistency issue(s) found", issues.len())
}

fn cmd_reconcile(paths: &OrchestratorPaths) -> Result<i32> {
    let removed = RunnerRecords::new(paths.runners_dir.clone()).reconcile_orphans(is_pid_alive)?;
    for record in &removed {
        println!("{} (pid {})", record.orchestration_id, record.pid);
    }
    Ok(exit_codes::OK)
}
