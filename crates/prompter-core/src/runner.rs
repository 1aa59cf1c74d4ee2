//! Pointer-driven sequential driver.
//!
//! Walks the task list in order, honoring `on_success` / `on_failure` flow
//! rules including named jumps. Loop protection refuses to re-enter a task
//! that already succeeded unless infinite loops are allowed; a task whose
//! previous dispatch failed may be re-entered through an explicit jump,
//! which is what makes fix-and-retry patterns terminate.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PrompterConfig, TaskConfig};
use crate::error::CoreError;
use crate::executor::{FlowDecision, TaskExecutor, flow_decision};
use crate::progress::{RunEvent, RunSummary, emit};
use crate::session::AgentClient;
use crate::state::StateStore;

/// Hard ceiling on dispatches per run, applied regardless of
/// `allow_infinite_loops`.
const MAX_TASK_ITERATIONS: u32 = 1000;

/// Sequential driver for runs without parallelism.
pub struct SequentialRunner {
    config: PrompterConfig,
    store: Arc<StateStore>,
    executor: TaskExecutor,
    cancel: CancellationToken,
    progress: Option<UnboundedSender<RunEvent>>,
    max_iterations: u32,
}

impl SequentialRunner {
    /// Creates a runner over the run's shared services.
    pub fn new(
        config: PrompterConfig,
        store: Arc<StateStore>,
        client: Arc<dyn AgentClient>,
        cancel: CancellationToken,
        dry_run: bool,
    ) -> Self {
        let executor = TaskExecutor::new(
            config.settings.clone(),
            store.clone(),
            client,
            cancel.clone(),
            dry_run,
        );
        Self {
            config,
            store,
            executor,
            cancel,
            progress: None,
            max_iterations: MAX_TASK_ITERATIONS,
        }
    }

    /// Subscribes a channel to run events.
    pub fn set_progress_sender(&mut self, tx: UnboundedSender<RunEvent>) {
        self.progress = Some(tx);
    }

    #[cfg(test)]
    fn set_iteration_limit(&mut self, limit: u32) {
        self.max_iterations = limit;
    }

    /// Runs the given tasks (usually all configured tasks) to completion.
    ///
    /// Jump targets outside `tasks_to_run` are pulled in from the full
    /// configuration, so a `--task` run can still follow its flow rules.
    /// Tasks recorded COMPLETED by a previous run are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RunawayLoop`] when the dispatch ceiling is hit.
    pub async fn run(&mut self, tasks_to_run: Vec<TaskConfig>) -> Result<RunSummary, CoreError> {
        info!(tasks = tasks_to_run.len(), "Starting sequential execution");
        emit(
            &self.progress,
            RunEvent::RunStarting {
                total: tasks_to_run.len(),
            },
        );

        // Completion carried over from a previous run with the same state
        // file; those tasks are not dispatched again.
        let previously_completed: Vec<String> = self.store.completed_tasks();

        let mut tasks = tasks_to_run;
        let mut summary = RunSummary::default();
        // Outcome of each task's most recent dispatch within this run.
        let mut last_outcome: BTreeMap<String, bool> = BTreeMap::new();
        let mut idx = 0usize;
        let mut via_jump = false;
        let mut iterations = 0u32;

        while idx < tasks.len() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let task = tasks[idx].clone();

            iterations += 1;
            if iterations > self.max_iterations {
                self.store.flush();
                return Err(CoreError::RunawayLoop {
                    limit: self.max_iterations,
                    task: task.name,
                });
            }

            if previously_completed.contains(&task.name)
                && !last_outcome.contains_key(&task.name)
            {
                info!(task = %task.name, "Already completed in recorded state; skipping");
                idx += 1;
                via_jump = false;
                continue;
            }

            if let Some(&prev_success) = last_outcome.get(&task.name) {
                let re_entry_allowed = self.config.settings.allow_infinite_loops
                    || (via_jump && !prev_success);
                if !re_entry_allowed {
                    warn!(
                        task = %task.name,
                        "Task has already been executed, skipping to avoid loop",
                    );
                    emit(
                        &self.progress,
                        RunEvent::TaskSkipped {
                            name: task.name.clone(),
                            reason: "loop protection".to_string(),
                        },
                    );
                    idx += 1;
                    via_jump = false;
                    continue;
                }
            }

            debug!(task = %task.name, iteration = iterations, "Dispatching task");
            self.store.mark_dispatch(&task.name);
            emit(
                &self.progress,
                RunEvent::TaskStarting {
                    name: task.name.clone(),
                },
            );

            let report = self.executor.execute(&task).await;
            last_outcome.insert(task.name.clone(), report.success);

            if report.success {
                emit(
                    &self.progress,
                    RunEvent::TaskCompleted {
                        name: task.name.clone(),
                        attempts: report.attempts,
                    },
                );
            } else {
                emit(
                    &self.progress,
                    RunEvent::TaskFailed {
                        name: task.name.clone(),
                        error: report.error.clone().unwrap_or_else(|| "unknown".to_string()),
                    },
                );
            }

            if report.cancelled {
                summary.cancelled = true;
                summary.reports.insert(task.name.clone(), report);
                break;
            }

            let decision = flow_decision(&task, report.success);
            let success = report.success;
            summary.reports.insert(task.name.clone(), report);

            match decision {
                FlowDecision::Stop => {
                    info!(
                        task = %task.name,
                        success,
                        "Flow rule requested stop; ending run",
                    );
                    summary.stopped = !success;
                    break;
                }
                FlowDecision::Next => {
                    idx += 1;
                    via_jump = false;
                }
                FlowDecision::Repeat => {
                    debug!(task = %task.name, "Flow rule requested repeat");
                    via_jump = true;
                }
                FlowDecision::Jump(target) => {
                    info!(task = %task.name, %target, "Jumping to task");
                    match self.jump_index(&mut tasks, &target) {
                        Some(target_idx) => {
                            idx = target_idx;
                            via_jump = true;
                        }
                        None => {
                            // Validation guarantees the target exists; a miss
                            // here means the subset run lost it. Fall through.
                            warn!(%target, "Jump target not found; advancing");
                            idx += 1;
                            via_jump = false;
                        }
                    }
                }
            }
        }

        self.store.flush();
        let success = summary.success();
        emit(&self.progress, RunEvent::RunFinished { success });
        info!(
            executed = summary.reports.len(),
            failed = summary.failed_count(),
            "Sequential execution finished",
        );
        Ok(summary)
    }

    /// Index of `target` in the working list, appending it from the full
    /// configuration when a subset run jumps outside itself.
    fn jump_index(&self, tasks: &mut Vec<TaskConfig>, target: &str) -> Option<usize> {
        if let Some(pos) = tasks.iter().position(|t| t.name == target) {
            return Some(pos);
        }
        let task = self.config.task_by_name(target)?;
        tasks.push(task.clone());
        Some(tasks.len() - 1)
    }

    /// Whether any task is recorded FAILED, for exit-code decisions.
    pub fn has_failures(&self) -> bool {
        !self.store.failed_tasks().is_empty()
    }
}

impl std::fmt::Debug for SequentialRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialRunner")
            .field("tasks", &self.config.tasks.len())
            .finish_non_exhaustive()
    }
}
