mod config;
mod sessions;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;

use testcycle_core::{
    Collaborators, CycleContext, CycleOutcome, IterationController, TaskQueue,
};
use testcycle_executor::{
    CommandFixExecutor, CommandTestExecutor, NoRollback, RollbackHandler, TaskDescriptor,
};
use testcycle_git::{ChangeCapture, GitRollback};
use testcycle_logging::{init_tracing, LogFormat, Logger};
use testcycle_policy::{CommandAnalyzer, ConvergencePolicy, FailureAnalyzer, HeuristicAnalyzer};
use testcycle_store::SessionCatalog;

use crate::config::{ProjectConfig, RollbackMode};
use crate::sessions::SessionsAction;

#[derive(Parser, Debug)]
#[command(
    name = "testcycle",
    about = "Drive a project's test suite to green with synthesized fixes",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// Working directory (default: current directory)
    #[arg(short = 'd', long, global = true)]
    working_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormatChoice,

    /// Diagnostic log level (RUST_LOG overrides)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the test-fix cycle (default)
    Run(RunArgs),

    /// Show the iteration history of a session
    History {
        /// Session ID (default: latest session of the working directory)
        id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Maximum evaluated test runs (overrides testcycle.toml)
    #[arg(short = 'n', long)]
    max_iterations: Option<u32>,

    /// Session ID to record into; an existing session is resumed
    #[arg(long)]
    session: Option<String>,

    /// Resume the latest session of the working directory
    #[arg(long)]
    resume: bool,

    /// Output final result as JSON
    #[arg(long)]
    json_output: bool,

    /// Dry run: show the plan and configuration without executing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let working_dir = match cli.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let working_dir = std::fs::canonicalize(&working_dir)
        .with_context(|| format!("Working directory {} not found", working_dir.display()))?;

    let config = ProjectConfig::load(&working_dir)?.unwrap_or_default();
    let log_format: LogFormat = cli.log_format.into();
    let log_dir = config.log_dir.as_ref().map(|dir| working_dir.join(dir));
    if let Some(ref dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    let guard = init_tracing(&cli.log_level, log_format, log_dir.as_deref());

    let catalog = match config.state_dir {
        Some(ref dir) => SessionCatalog::with_dir(working_dir.join(dir)),
        None => SessionCatalog::new()?,
    };

    match cli.command {
        Some(Commands::History { id, json }) => {
            sessions::handle_history_command(&catalog, &working_dir, id, json)
        }
        Some(Commands::Sessions { action }) => {
            sessions::handle_sessions_command(&catalog, action)
        }
        Some(Commands::Run(args)) => {
            let code = run(args, &config, &catalog, working_dir, log_dir, log_format).await?;
            drop(guard);
            std::process::exit(code);
        }
        None => {
            let code = run(cli.run, &config, &catalog, working_dir, log_dir, log_format).await?;
            drop(guard);
            std::process::exit(code);
        }
    }
}

/// Run the cycle and return the process exit code
async fn run(
    args: RunArgs,
    config: &ProjectConfig,
    catalog: &SessionCatalog,
    working_dir: PathBuf,
    log_dir: Option<PathBuf>,
    log_format: LogFormat,
) -> Result<i32> {
    let session_id = resolve_session(&args, catalog, &working_dir)?;
    let max_iterations = config.max_iterations(args.max_iterations);
    let tasks = config.initial_tasks();

    if args.dry_run {
        print_dry_run(config, &session_id, &working_dir, max_iterations, &tasks);
        return Ok(0);
    }

    let test_command = config
        .commands
        .test
        .as_deref()
        .context("No test command configured. Set [commands].test in testcycle.toml")?;
    let fix_command = config
        .commands
        .fix
        .as_deref()
        .context("No fix command configured. Set [commands].fix in testcycle.toml")?;

    let mut tests = CommandTestExecutor::new(test_command);
    if let Some(ref command) = config.commands.test_gen {
        tests = tests.with_test_gen(command);
    }
    let capture = Arc::new(ChangeCapture::new());
    let fixer = CommandFixExecutor::new(fix_command).with_tracker(capture.clone());
    let analyzer: Box<dyn FailureAnalyzer> = match config.commands.analyze {
        Some(ref command) => Box::new(CommandAnalyzer::new(command)),
        None => Box::new(HeuristicAnalyzer),
    };
    let rollback: Box<dyn RollbackHandler> = match config.rollback {
        RollbackMode::Git => Box::new(GitRollback::with_baseline(capture)),
        RollbackMode::None => Box::new(NoRollback),
    };

    let mut queue = TaskQueue::new(tasks).context("Invalid task plan")?;
    let store = catalog
        .open(&session_id)
        .with_context(|| format!("Failed to open session {}", session_id))?;

    let logger = match log_dir {
        Some(dir) => {
            let path = dir.join(format!("{}.events.jsonl", session_id));
            Logger::with_file(log_format, &path)
                .with_context(|| format!("Failed to open event log {}", path.display()))?
        }
        None => Logger::new(log_format),
    };

    let collaborators = Collaborators::new(&tests, &fixer, analyzer.as_ref())
        .with_rollback(rollback.as_ref());
    let mut controller = IterationController::new(collaborators, &store, Arc::new(logger))
        .with_policy(ConvergencePolicy::new(config.policy.clone()));
    if let Some(timeout) = config.timeouts.dispatch {
        controller = controller.with_dispatch_timeout(timeout);
    }
    if let Some(timeout) = config.timeouts.session {
        controller = controller.with_session_timeout(timeout);
    }

    // Handle Ctrl+C gracefully
    let interrupt_handle = controller.interrupt_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Stopping after the current task...");
        interrupt_handle.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let context = CycleContext::new(session_id.clone(), working_dir)
        .with_max_iterations(max_iterations);
    let outcome = controller.run(&mut queue, context).await?;

    if args.json_output {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome, &session_id);
    }

    Ok(outcome.exit_code())
}

fn resolve_session(args: &RunArgs, catalog: &SessionCatalog, working_dir: &Path) -> Result<String> {
    if let Some(ref id) = args.session {
        return Ok(id.clone());
    }
    if args.resume {
        return sessions::latest_for(catalog, working_dir)?.with_context(|| {
            format!("No session to resume for {}", working_dir.display())
        });
    }
    Ok(SessionCatalog::new_session_id(working_dir, Utc::now()))
}

fn print_dry_run(
    config: &ProjectConfig,
    session_id: &str,
    working_dir: &Path,
    max_iterations: u32,
    tasks: &[TaskDescriptor],
) {
    let command = |c: &Option<String>| c.clone().unwrap_or_else(|| "(not set)".to_string());

    println!("=== Dry Run ===");
    println!("Session: {}", session_id);
    println!("Working dir: {}", working_dir.display());
    println!("Max iterations: {}", max_iterations);
    println!("Test command: {}", command(&config.commands.test));
    println!("Fix command: {}", command(&config.commands.fix));
    println!(
        "Analyzer: {}",
        config
            .commands
            .analyze
            .as_deref()
            .unwrap_or("heuristic fallback")
    );
    println!("Rollback: {:?}", config.rollback);
    println!(
        "Policy: partial >= {}%, regression drop > {}pp, stuck window {}",
        config.policy.partial_success_threshold,
        config.policy.regression_drop,
        config.policy.stuck_window
    );
    println!("Plan:");
    for task in tasks {
        if task.depends_on.is_empty() {
            println!("  {} ({})", task.id, task.kind);
        } else {
            println!(
                "  {} ({}) after {}",
                task.id,
                task.kind,
                task.depends_on.join(", ")
            );
        }
    }
}

fn print_outcome(outcome: &CycleOutcome, session_id: &str) {
    eprintln!();
    match outcome {
        CycleOutcome::Succeeded {
            iterations,
            total_duration_secs,
            ..
        } => {
            eprintln!("{}", "=== SUCCEEDED ===".bright_green().bold());
            eprintln!("All tests pass after {} iteration(s)", iterations);
            eprintln!("Duration: {:.1}s", total_duration_secs);
        }
        CycleOutcome::PartiallySucceeded {
            iterations,
            pass_rate,
            caveats,
            total_duration_secs,
            ..
        } => {
            eprintln!("{}", "=== PARTIALLY SUCCEEDED ===".bright_yellow().bold());
            eprintln!(
                "Pass rate {:.1}% after {} iteration(s)",
                pass_rate, iterations
            );
            eprintln!("Duration: {:.1}s", total_duration_secs);
            eprintln!("Remaining low-criticality failures, review before merging:");
            for caveat in caveats {
                if caveat.message.is_empty() {
                    eprintln!("  - {}", caveat.test_id);
                } else {
                    eprintln!("  - {}: {}", caveat.test_id, caveat.message);
                }
            }
        }
        CycleOutcome::Blocked {
            iterations,
            reason,
            last_failure,
            total_duration_secs,
            ..
        } => {
            eprintln!("{}", "=== BLOCKED ===".bright_red().bold());
            eprintln!("Reason: {}", reason);
            eprintln!("Iterations: {}", iterations);
            eprintln!("Duration: {:.1}s", total_duration_secs);
            if let Some(failure) = last_failure {
                eprintln!(
                    "Last pass rate: {:.1}% ({} failing)",
                    failure.pass_rate,
                    failure.failures.len()
                );
                for record in failure.failures.iter().take(10) {
                    eprintln!("  - {} [{}]", record.test_id, record.criticality);
                }
                if !failure.rolled_back_files.is_empty() {
                    eprintln!("Rolled back: {} file(s)", failure.rolled_back_files.len());
                }
            }
        }
    }
    eprintln!("Session: {}", session_id.dimmed());
}
