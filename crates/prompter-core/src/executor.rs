//! Per-task execution: the attempt loop and flow routing.
//!
//! One [`TaskExecutor::execute`] call runs a task's AI → settle → verify
//! cycle under the retry budget, records every attempt in the state store,
//! and reports the outcome. Drivers turn the outcome into the next task via
//! [`flow_decision`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RunSettings, TaskConfig};
use crate::error::SessionError;
use crate::session::{AgentClient, AgentRequest, AgentSession};
use crate::state::StateStore;
use crate::verify::Verifier;

/// What a driver should do after a task reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDecision {
    /// Advance to the next declared task.
    Next,
    /// Terminate the run.
    Stop,
    /// Re-enter the same task.
    Repeat,
    /// Jump to the named task.
    Jump(String),
}

/// Maps a task's flow rule to a decision.
///
/// `retry` only matters inside the attempt loop; once attempts are
/// exhausted the run continues with the next task, matching the sequential
/// driver's behavior.
pub fn flow_decision(task: &TaskConfig, success: bool) -> FlowDecision {
    let action = if success {
        task.on_success.as_str()
    } else {
        task.on_failure.as_str()
    };

    match action {
        "stop" => FlowDecision::Stop,
        "repeat" => FlowDecision::Repeat,
        "next" | "retry" => FlowDecision::Next,
        name => FlowDecision::Jump(name.to_string()),
    }
}

/// Result of executing one task to a terminal status.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Task name.
    pub task_name: String,
    /// Whether verification succeeded within the attempt budget.
    pub success: bool,
    /// Attempts consumed by this execution.
    pub attempts: u32,
    /// AI reply text from the final attempt.
    pub output: String,
    /// Failure description, when unsuccessful.
    pub error: Option<String>,
    /// Verification diagnostic from the final attempt.
    pub verification_output: String,
    /// Session id produced by the final attempt.
    pub session_id: Option<String>,
    /// The failure triggered `on_failure = "stop"`: terminate the run.
    pub fatal: bool,
    /// Execution was aborted by the global cancel signal.
    pub cancelled: bool,
}

impl TaskReport {
    fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            success: false,
            attempts: 0,
            output: String::new(),
            error: None,
            verification_output: String::new(),
            session_id: None,
            fatal: false,
            cancelled: false,
        }
    }
}

/// Executes single tasks against the shared services of a run.
pub struct TaskExecutor {
    settings: RunSettings,
    store: Arc<StateStore>,
    session: AgentSession,
    verifier: Verifier,
    cancel: CancellationToken,
    dry_run: bool,
}

impl TaskExecutor {
    /// Creates an executor bound to the run's store, agent, and cancel token.
    pub fn new(
        settings: RunSettings,
        store: Arc<StateStore>,
        client: Arc<dyn AgentClient>,
        cancel: CancellationToken,
        dry_run: bool,
    ) -> Self {
        let verifier = Verifier::new(settings.effective_working_directory());
        Self {
            settings,
            store,
            session: AgentSession::new(client, cancel.clone()),
            verifier,
            cancel,
            dry_run,
        }
    }

    /// Runs one task's attempt loop to a terminal status.
    ///
    /// The attempt budget is `max_attempts` when `on_failure = "retry"`,
    /// otherwise exactly one attempt. Every attempt is recorded in the
    /// state store before and after it runs; the final call marks the task
    /// COMPLETED or FAILED.
    pub async fn execute(&self, task: &TaskConfig) -> TaskReport {
        info!(task = %task.name, "Starting task");
        let mut report = TaskReport::new(&task.name);

        if self.dry_run {
            return self.execute_dry(task);
        }

        let budget = if task.on_failure == "retry" {
            task.effective_max_attempts()
        } else {
            1
        };

        while report.attempts < budget {
            report.attempts += 1;
            self.store.mark_attempt_start(&task.name);
            debug!(task = %task.name, attempt = report.attempts, budget, "Attempt starting");

            match self.run_attempt(task, &mut report).await {
                AttemptOutcome::Success => {
                    self.store.mark_attempt(
                        &task.name,
                        true,
                        None,
                        report.session_id.clone(),
                    );
                    report.success = true;
                    info!(task = %task.name, attempts = report.attempts, "Task completed");
                    return report;
                }
                AttemptOutcome::Failed(error) => {
                    report.error = Some(error.clone());
                    if report.attempts < budget {
                        // Keep the session id and error visible mid-retry
                        // without flipping the status to a terminal state.
                        let session_id = report.session_id.clone();
                        self.store.update(&task.name, |state| {
                            if let Some(id) = session_id {
                                state.session_id = Some(id);
                            }
                            state.last_error = Some(error.clone());
                        });
                        warn!(
                            task = %task.name,
                            attempt = report.attempts,
                            error = %error,
                            "Attempt failed; retrying",
                        );
                        continue;
                    }
                }
                AttemptOutcome::Cancelled => {
                    report.cancelled = true;
                    report.error = Some("cancelled".to_string());
                    break;
                }
            }
            break;
        }

        let error = report
            .error
            .clone()
            .unwrap_or_else(|| format!("Task failed after {} attempts", report.attempts));
        self.store
            .mark_attempt(&task.name, false, Some(error), report.session_id.clone());

        report.fatal = !report.cancelled && task.on_failure == "stop";
        warn!(
            task = %task.name,
            attempts = report.attempts,
            fatal = report.fatal,
            error = ?report.error,
            "Task failed",
        );
        report
    }

    /// One AI → settle → verify cycle.
    async fn run_attempt(&self, task: &TaskConfig, report: &mut TaskReport) -> AttemptOutcome {
        let resume_session_id = if task.resume_previous_session {
            let current = task.name.clone();
            let found = self
                .store
                .most_recent_session_id(|name, state| {
                    name != current && state.status.is_terminal()
                });
            if let Some(ref id) = found {
                debug!(task = %task.name, session = %id, "Resuming previous session");
            }
            found
        } else {
            None
        };

        let request = AgentRequest {
            prompt: task.prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            working_directory: Some(self.settings.effective_working_directory()),
            resume_session_id,
        };

        let reply = match self.session.send(&request, task.timeout_duration()).await {
            Ok(reply) => reply,
            Err(SessionError::Cancelled) => return AttemptOutcome::Cancelled,
            Err(e) => return AttemptOutcome::Failed(e.to_string()),
        };

        report.output = reply.text;
        if reply.session_id.is_some() {
            report.session_id = reply.session_id;
        }

        // Give file writes and build artifacts a moment to settle.
        let interval = self.settings.check_interval_duration();
        if !interval.is_zero() {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return AttemptOutcome::Cancelled,
                () = tokio::time::sleep(interval) => {}
            }
        }

        let verify = self
            .verifier
            .run(&task.verify_command, task.verify_success_code)
            .await;
        report.verification_output = verify.output.clone();

        if verify.success {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failed(format!("Verification failed: {}", verify.output))
        }
    }

    /// Simulates the task without touching the AI or running verification.
    fn execute_dry(&self, task: &TaskConfig) -> TaskReport {
        let mut preview = task.prompt.clone();
        if preview.chars().count() > 50 {
            preview = preview.chars().take(50).collect();
        }

        self.store.mark_attempt_start(&task.name);
        self.store.mark_attempt(&task.name, true, None, None);

        let mut report = TaskReport::new(&task.name);
        report.success = true;
        report.attempts = 1;
        report.output = format!("[DRY RUN] Would execute prompt: {preview}...");
        report.verification_output =
            format!("[DRY RUN] Would run verification: {}", task.verify_command);
        report
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// Outcome of one attempt inside the retry loop.
enum AttemptOutcome {
    Success,
    Failed(String),
    Cancelled,
}
