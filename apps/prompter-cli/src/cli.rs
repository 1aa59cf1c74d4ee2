//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Run AI-assisted tasks from a declarative TOML configuration.
#[derive(Debug, Parser)]
#[command(name = "prompter", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    pub config: Option<PathBuf>,

    /// Show what would run without invoking the assistant.
    #[arg(long)]
    pub dry_run: bool,

    /// Run only the named task (sequential mode).
    #[arg(long, value_name = "NAME")]
    pub task: Option<String>,

    /// Print the recorded run state and exit.
    #[arg(long)]
    pub status: bool,

    /// Delete the recorded run state and exit.
    #[arg(long)]
    pub clear_state: bool,

    /// Path of the state file (default: .prompter_state.json in the
    /// working directory).
    #[arg(long, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Verbose output (per-task details, debug logging).
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Force one-line-per-event progress output.
    #[arg(long)]
    pub simple_progress: bool,

    /// Disable progress output entirely.
    #[arg(long)]
    pub no_progress: bool,
}
