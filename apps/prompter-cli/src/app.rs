//! Command dispatch: status, clear-state, and run execution.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use prompter_core::{
    CliAgentClient, ParallelCoordinator, ProgressMode, PrompterConfig, RunEvent, RunSummary,
    SequentialRunner, StateStore, TaskConfig, DEFAULT_STATE_FILE,
};

use crate::cli::Cli;

/// Exit code for failed tasks and configuration/runtime errors.
const EXIT_FAILURE: u8 = 1;

/// Exit code for invalid command-line usage.
const EXIT_USAGE: u8 = 2;

/// Executes the parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> u8 {
    debug!(?cli, "Starting prompter");

    // Status and clear-state work without a configuration file.
    if cli.status || cli.clear_state {
        let path = cli
            .state_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
        let store = match StateStore::load(&path) {
            Ok(store) => store,
            Err(e) => {
                eprintln!("Error: {e}");
                return EXIT_FAILURE;
            }
        };
        if cli.status {
            print_status(&store, cli.verbose);
            return 0;
        }
        return match store.clear() {
            Ok(()) => {
                println!("State cleared.");
                0
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_FAILURE
            }
        };
    }

    let Some(config_path) = cli.config.clone() else {
        eprintln!(
            "Error: a configuration file is required unless using --status or --clear-state"
        );
        return EXIT_USAGE;
    };

    let config = match PrompterConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = config.ensure_valid() {
        eprintln!("{e}");
        return EXIT_FAILURE;
    }

    let state_path = cli.state_file.clone().unwrap_or_else(|| {
        config
            .settings
            .effective_working_directory()
            .join(DEFAULT_STATE_FILE)
    });
    let store = match StateStore::load(&state_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Hint: run with --clear-state to discard the corrupt state file.");
            return EXIT_FAILURE;
        }
    };
    let names: Vec<&str> = config.tasks.iter().map(|t| t.name.as_str()).collect();
    store.reconcile_with_tasks(&names);

    let tasks_to_run = match select_tasks(&config, cli.task.as_deref()) {
        Ok(tasks) => tasks,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return EXIT_FAILURE;
        }
    };

    println!("Running {} task(s)...", tasks_to_run.len());
    if cli.dry_run {
        println!("[DRY RUN MODE - No actual changes will be made]");
    }

    // Interrupt handling: first Ctrl-C cancels the run gracefully.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupt received; cancelling run...");
                cancel.cancel();
            }
        });
    }

    let progress = resolve_progress_mode(&cli, &config);
    let (progress_tx, printer) = if progress == ProgressMode::None {
        (None, None)
    } else {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });
        (Some(tx), Some(printer))
    };

    let client = Arc::new(CliAgentClient::default());
    let use_parallel =
        config.settings.enable_parallel && config.has_dependencies() && cli.task.is_none();

    let result = if use_parallel {
        info!("Using parallel execution due to task dependencies");
        println!(
            "\nParallel execution enabled (max {} concurrent tasks)",
            config.settings.max_parallel_tasks
        );
        match ParallelCoordinator::new(config, store.clone(), client, cancel, cli.dry_run) {
            Ok(mut coordinator) => {
                if let Some(tx) = progress_tx {
                    coordinator.set_progress_sender(tx);
                }
                coordinator.execute_all().await
            }
            Err(e) => Err(e),
        }
    } else {
        info!("Using sequential execution");
        if config.has_dependencies() {
            println!("\nNote: dependencies defined but parallel execution is disabled");
        }
        let mut runner =
            SequentialRunner::new(config, store.clone(), client, cancel, cli.dry_run);
        if let Some(tx) = progress_tx {
            runner.set_progress_sender(tx);
        }
        runner.run(tasks_to_run).await
    };

    if let Some(printer) = printer {
        // Drivers drop their sender on return; the printer drains and ends.
        let _ = printer.await;
    }

    match result {
        Ok(summary) => {
            println!("\nFinal status:");
            print_status(&store, cli.verbose);
            exit_code_for(&summary, &store)
        }
        Err(e) => {
            eprintln!("\nError: {e}");
            EXIT_FAILURE
        }
    }
}

/// Tasks to execute: all of them, or the single `--task` selection.
fn select_tasks(
    config: &PrompterConfig,
    task_name: Option<&str>,
) -> Result<Vec<TaskConfig>, String> {
    match task_name {
        Some(name) => match config.task_by_name(name) {
            Some(task) => Ok(vec![task.clone()]),
            None => Err(format!("Task '{name}' not found in configuration")),
        },
        None => Ok(config.tasks.clone()),
    }
}

/// Effective progress mode after flag overrides.
fn resolve_progress_mode(cli: &Cli, config: &PrompterConfig) -> ProgressMode {
    if cli.no_progress {
        ProgressMode::None
    } else if cli.simple_progress {
        ProgressMode::Simple
    } else {
        config.settings.progress_mode
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarting { total } => println!("Starting {total} task(s)"),
        RunEvent::TaskStarting { name } => println!("  → {name}: running"),
        RunEvent::TaskCompleted { name, attempts } => {
            println!("  ✓ {name}: completed (attempts: {attempts})");
        }
        RunEvent::TaskFailed { name, error } => println!("  ✗ {name}: failed - {error}"),
        RunEvent::TaskSkipped { name, reason } => println!("  - {name}: skipped ({reason})"),
        RunEvent::RunFinished { success } => {
            if *success {
                println!("All tasks completed successfully");
            } else {
                println!("Run finished with failures");
            }
        }
        _ => {}
    }
}

/// Prints the recorded run state.
fn print_status(store: &StateStore, verbose: bool) {
    let snapshot = store.snapshot();
    println!("Session: {}", snapshot.session_id);
    println!("Tasks tracked: {}", snapshot.tasks.len());
    for (status, count) in snapshot.status_counts() {
        println!("  {status}: {count}");
    }

    if verbose {
        for (name, state) in &snapshot.tasks {
            println!(
                "  {name}: {} (attempts: {}, executions: {})",
                state.status, state.attempts, state.execution_count
            );
            if let Some(ref session) = state.session_id {
                println!("    session: {session}");
            }
            if let Some(ref error) = state.last_error {
                println!("    last error: {error}");
            }
        }
    }
}

/// 0 when everything succeeded; 1 on any failed task or interrupted run.
fn exit_code_for(summary: &RunSummary, store: &StateStore) -> u8 {
    if summary.success() && store.failed_tasks().is_empty() {
        0
    } else {
        EXIT_FAILURE
    }
}
