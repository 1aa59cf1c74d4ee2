//! Progress events emitted by the drivers.
//!
//! Drivers publish [`RunEvent`] values through an optional unbounded
//! channel; the CLI maps them to plain output lines. Rendering lives
//! entirely outside the core.

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::executor::TaskReport;

/// Real-time events from a run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RunEvent {
    /// Emitted once before the first dispatch.
    RunStarting {
        /// Number of tasks in the run.
        total: usize,
    },
    /// A task was dispatched.
    TaskStarting {
        /// Task name.
        name: String,
    },
    /// A task reached COMPLETED.
    TaskCompleted {
        /// Task name.
        name: String,
        /// Attempts consumed.
        attempts: u32,
    },
    /// A task reached FAILED.
    TaskFailed {
        /// Task name.
        name: String,
        /// Failure description.
        error: String,
    },
    /// A task was SKIPPED.
    TaskSkipped {
        /// Task name.
        name: String,
        /// Why it was skipped.
        reason: String,
    },
    /// The run finished.
    RunFinished {
        /// Whether no task failed.
        success: bool,
    },
}

/// Best-effort event emission; a missing or closed channel is ignored.
pub(crate) fn emit(tx: &Option<UnboundedSender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Final outcome of a run, as reported by either driver.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Reports for every task that was executed.
    pub reports: BTreeMap<String, TaskReport>,
    /// A task with `on_failure = "stop"` failed and ended the run.
    pub stopped: bool,
    /// The run was interrupted by the cancel signal.
    pub cancelled: bool,
}

impl RunSummary {
    /// Number of executed tasks that failed.
    pub fn failed_count(&self) -> usize {
        self.reports.values().filter(|r| !r.success).count()
    }

    /// Whether every executed task succeeded and the run was not cut short.
    pub fn success(&self) -> bool {
        !self.stopped && !self.cancelled && self.failed_count() == 0
    }
}
