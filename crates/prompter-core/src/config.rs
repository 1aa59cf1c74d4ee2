//! Configuration model and TOML loading.
//!
//! A prompter configuration has a `[settings]` table and an ordered
//! `[[tasks]]` array. Parsing reports the line/column of the first
//! offending token with surrounding context; validation accumulates every
//! problem across all tasks before reporting.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::graph::TaskGraph;

/// Reserved action words that cannot be used as task names.
pub const RESERVED_ACTIONS: [&str; 4] = ["next", "stop", "retry", "repeat"];

/// Actions accepted in `on_success` besides task names.
const ON_SUCCESS_ACTIONS: [&str; 3] = ["next", "stop", "repeat"];

/// Actions accepted in `on_failure` besides task names.
const ON_FAILURE_ACTIONS: [&str; 3] = ["retry", "stop", "next"];

/// Default delay between AI completion and verification, in seconds.
const DEFAULT_CHECK_INTERVAL: u64 = 5;

/// Default per-task attempt budget.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How progress is rendered while a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// Pick `rich` on a TTY, `simple` otherwise.
    #[default]
    Auto,
    /// Live multi-task display.
    Rich,
    /// One plain line per event.
    Simple,
    /// No progress output.
    None,
}

/// Configuration for a single task.
///
/// # Example
///
/// ```
/// use prompter_core::config::TaskConfig;
///
/// let task: TaskConfig = toml::from_str(r#"
///     name = "build"
///     prompt = "Fix all compiler warnings"
///     verify_command = "cargo build"
/// "#).unwrap();
/// assert_eq!(task.name, "build");
/// assert_eq!(task.on_success, "next");
/// assert_eq!(task.on_failure, "retry");
/// assert_eq!(task.effective_max_attempts(), 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Unique task name; must not be a reserved action word.
    pub name: String,

    /// Instruction text delivered to the AI assistant.
    pub prompt: String,

    /// Shell-or-argv command judging success.
    pub verify_command: String,

    /// Exit code the verify command must return.
    pub verify_success_code: i32,

    /// Action after a successful attempt: `next`, `stop`, `repeat`, or a
    /// task name to jump to.
    pub on_success: String,

    /// Action after a failed attempt: `retry`, `stop`, `next`, or a task
    /// name to jump to.
    pub on_failure: String,

    /// Attempt budget; only meaningful with `on_failure = "retry"`.
    /// `None` means the default of 3.
    pub max_attempts: Option<u32>,

    /// Optional timeout for the AI phase, in seconds; unbounded when absent.
    pub timeout: Option<u64>,

    /// Extra system prompt passed to the AI adapter verbatim.
    pub system_prompt: Option<String>,

    /// Continue the most recent recorded AI session instead of starting fresh.
    pub resume_previous_session: bool,

    /// Names of tasks that must complete before this one starts.
    pub depends_on: Vec<String>,

    /// When true, this task must run alone.
    pub exclusive: bool,

    /// Reserved for future resource-aware scheduling.
    pub priority: i64,
    /// Reserved for future resource-aware scheduling.
    pub cpu_required: f64,
    /// Reserved for future resource-aware scheduling (MB).
    pub memory_required: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            prompt: String::new(),
            verify_command: String::new(),
            verify_success_code: 0,
            on_success: "next".to_string(),
            on_failure: "retry".to_string(),
            max_attempts: None,
            timeout: None,
            system_prompt: None,
            resume_previous_session: false,
            depends_on: Vec::new(),
            exclusive: false,
            priority: 0,
            cpu_required: 1.0,
            memory_required: 512,
        }
    }
}

impl TaskConfig {
    /// Attempt budget with the default applied.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// AI-phase timeout as a [`Duration`], if configured.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Scalar run settings from the `[settings]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Delay between AI completion and verification, in seconds.
    pub check_interval: u64,

    /// Global retry ceiling; a task's own `max_attempts` wins.
    pub max_retries: u32,

    /// Working directory for AI and verification subprocesses.
    pub working_directory: Option<PathBuf>,

    /// Allow tasks to be dispatched more than once.
    pub allow_infinite_loops: bool,

    /// Upper bound on concurrently running tasks.
    pub max_parallel_tasks: usize,

    /// Use the DAG coordinator when dependencies are declared.
    pub enable_parallel: bool,

    /// Progress rendering mode.
    pub progress_mode: ProgressMode,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_retries: 3,
            working_directory: None,
            allow_infinite_loops: false,
            max_parallel_tasks: 4,
            enable_parallel: true,
            progress_mode: ProgressMode::Auto,
        }
    }
}

impl RunSettings {
    /// Check interval as a [`Duration`].
    pub fn check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// Effective working directory, defaulting to the process cwd.
    pub fn effective_working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

/// Raw document shape as it appears on disk.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    settings: RunSettings,
    tasks: Vec<TaskConfig>,
}

/// A loaded prompter configuration: settings plus the ordered task list.
#[derive(Debug, Clone)]
pub struct PrompterConfig {
    /// Scalar run settings.
    pub settings: RunSettings,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskConfig>,
    /// Path the configuration was loaded from.
    pub path: PathBuf,
}

impl PrompterConfig {
    /// Loads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] when the file is missing or fails to
    /// parse; parse errors carry line/column plus surrounding lines.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        debug!(path = %path.display(), "Loading configuration");

        let source = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(vec![format!(
                "Configuration file not found: {}: {e}",
                path.display()
            )])
        })?;

        let raw: RawConfig = toml::from_str(&source).map_err(|e| {
            CoreError::Config(vec![render_parse_error(path, &source, &e)])
        })?;

        debug!(
            tasks = raw.tasks.len(),
            max_parallel = raw.settings.max_parallel_tasks,
            enable_parallel = raw.settings.enable_parallel,
            "Configuration parsed",
        );

        Ok(Self {
            settings: raw.settings,
            tasks: raw.tasks,
            path: path.to_path_buf(),
        })
    }

    /// Parses a configuration from an in-memory TOML string.
    ///
    /// # Errors
    ///
    /// Same as [`PrompterConfig::load`], with a placeholder path.
    pub fn from_toml_str(source: &str) -> Result<Self, CoreError> {
        let path = PathBuf::from("<inline>");
        let raw: RawConfig = toml::from_str(source)
            .map_err(|e| CoreError::Config(vec![render_parse_error(&path, source, &e)]))?;
        Ok(Self {
            settings: raw.settings,
            tasks: raw.tasks,
            path,
        })
    }

    /// Looks a task up by name.
    pub fn task_by_name(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Whether any task declares dependencies.
    pub fn has_dependencies(&self) -> bool {
        self.tasks.iter().any(|t| !t.depends_on.is_empty())
    }

    /// Validates the configuration, returning every problem found.
    ///
    /// An empty vector means the configuration is executable. Suspicious
    /// but legal combinations (e.g. `on_failure = "stop"` with
    /// `max_attempts > 1`) are logged as warnings, not returned.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tasks.is_empty() {
            errors.push("No tasks defined in configuration".to_string());
        }

        let task_names: BTreeSet<&str> = self
            .tasks
            .iter()
            .filter(|t| !t.name.is_empty())
            .map(|t| t.name.as_str())
            .collect();

        let mut seen = BTreeSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.name.is_empty() {
                errors.push(format!("Task {i}: name is required"));
            } else if RESERVED_ACTIONS.contains(&task.name.as_str()) {
                errors.push(format!(
                    "Task {i}: name '{}' is a reserved word and cannot be used as a task name. \
                     Reserved words are: {}",
                    task.name,
                    RESERVED_ACTIONS.join(", "),
                ));
            } else if !seen.insert(task.name.as_str()) {
                errors.push(format!(
                    "Task {i}: duplicate task name '{}'",
                    task.name
                ));
            }

            if task.prompt.is_empty() {
                errors.push(format!("Task {i} ({}): prompt is required", task.name));
            }
            if task.verify_command.is_empty() {
                errors.push(format!(
                    "Task {i} ({}): verify_command is required",
                    task.name
                ));
            }

            if !ON_SUCCESS_ACTIONS.contains(&task.on_success.as_str())
                && !task_names.contains(task.on_success.as_str())
            {
                errors.push(format!(
                    "Task {i} ({}): on_success '{}' must be one of {} or a valid task name",
                    task.name,
                    task.on_success,
                    ON_SUCCESS_ACTIONS.join(", "),
                ));
            }

            if !ON_FAILURE_ACTIONS.contains(&task.on_failure.as_str())
                && !task_names.contains(task.on_failure.as_str())
            {
                errors.push(format!(
                    "Task {i} ({}): on_failure '{}' must be one of {} or a valid task name",
                    task.name,
                    task.on_failure,
                    ON_FAILURE_ACTIONS.join(", "),
                ));
            }

            if let Some(n) = task.max_attempts {
                if n < 1 {
                    errors.push(format!(
                        "Task {i} ({}): max_attempts must be >= 1",
                        task.name
                    ));
                } else if n > 1 && task.on_failure != "retry" {
                    warn!(
                        task = %task.name,
                        max_attempts = n,
                        on_failure = %task.on_failure,
                        "max_attempts is ignored unless on_failure = \"retry\"",
                    );
                }
            }
        }

        if self.settings.max_parallel_tasks < 1 {
            errors.push("settings: max_parallel_tasks must be >= 1".to_string());
        }

        // Dependency references and cycles; the graph reports every cycle.
        if self.has_dependencies() {
            for task in &self.tasks {
                for dep in &task.depends_on {
                    if !task_names.contains(dep.as_str()) {
                        errors.push(format!(
                            "Task '{}' depends on unknown task '{dep}'",
                            task.name
                        ));
                    }
                }
            }

            match TaskGraph::build(&self.tasks) {
                Ok(_) => debug!("Dependency graph validation passed"),
                Err(graph_errors) => errors.extend(graph_errors),
            }
        }

        debug!(errors = errors.len(), "Configuration validation complete");
        errors
    }

    /// Validates and converts any problems into a [`CoreError::Config`].
    ///
    /// # Errors
    ///
    /// Returns the accumulated validation errors.
    pub fn ensure_valid(&self) -> Result<(), CoreError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Config(errors))
        }
    }

    /// Builds the dependency graph for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] with missing-dependency and cycle
    /// errors.
    pub fn build_graph(&self) -> Result<TaskGraph, CoreError> {
        TaskGraph::build(&self.tasks).map_err(CoreError::Config)
    }
}

/// Formats a TOML parse error with line/column and surrounding context.
fn render_parse_error(path: &Path, source: &str, err: &toml::de::Error) -> String {
    let mut msg = format!("TOML parsing error in {}:\n{err}", path.display());

    if let Some(span) = err.span() {
        let (line, col) = offset_to_line_col(source, span.start);
        let lines: Vec<&str> = source.lines().collect();

        if line >= 1 && line <= lines.len() {
            let start = line.saturating_sub(3);
            let end = (line + 2).min(lines.len());

            msg.push_str("\n\nContext:\n");
            for (idx, text) in lines.iter().enumerate().take(end).skip(start) {
                let lineno = idx + 1;
                if lineno == line {
                    msg.push_str(&format!(">>> {lineno:4} | {text}\n"));
                    msg.push_str(&format!("{}^\n", " ".repeat(col + 10)));
                } else {
                    msg.push_str(&format!("    {lineno:4} | {text}\n"));
                }
            }
        }
    }

    msg
}

/// Converts a byte offset into 1-based line and 0-based column numbers.
fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let before = &source[..clamped];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(clamped, |pos| clamped - pos - 1);
    (line, col)
}
