//! DAG-driven parallel scheduler.
//!
//! A single decision loop promotes, dispatches, waits, and reaps; workers
//! run concurrently in a [`JoinSet`], gated by the [`ResourcePool`]. The
//! loop reconsiders READY tasks on every iteration, so a task held back by
//! the parallelism cap is retried as soon as a slot frees up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PrompterConfig;
use crate::error::CoreError;
use crate::executor::{TaskExecutor, TaskReport};
use crate::graph::TaskGraph;
use crate::pool::ResourcePool;
use crate::progress::{RunEvent, RunSummary, emit};
use crate::session::AgentClient;
use crate::state::{StateStore, TaskStatus};

/// How often the wait step wakes to stay responsive to cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long cancelled workers get to finish before being abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Coordinates parallel execution of a validated configuration.
pub struct ParallelCoordinator {
    config: PrompterConfig,
    graph: TaskGraph,
    store: Arc<StateStore>,
    executor: Arc<TaskExecutor>,
    cancel: CancellationToken,
    /// Child token shared with workers; tripped on fatal stop so in-flight
    /// tasks abort without cancelling the caller's token.
    worker_cancel: CancellationToken,
    progress: Option<UnboundedSender<RunEvent>>,
}

impl ParallelCoordinator {
    /// Builds a coordinator for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] when the dependency graph is invalid.
    pub fn new(
        config: PrompterConfig,
        store: Arc<StateStore>,
        client: Arc<dyn AgentClient>,
        cancel: CancellationToken,
        dry_run: bool,
    ) -> Result<Self, CoreError> {
        let graph = config.build_graph()?;
        let worker_cancel = cancel.child_token();
        let executor = Arc::new(TaskExecutor::new(
            config.settings.clone(),
            store.clone(),
            client,
            worker_cancel.clone(),
            dry_run,
        ));
        Ok(Self {
            config,
            graph,
            store,
            executor,
            cancel,
            worker_cancel,
            progress: None,
        })
    }

    /// Subscribes a channel to run events.
    pub fn set_progress_sender(&mut self, tx: UnboundedSender<RunEvent>) {
        self.progress = Some(tx);
    }

    /// Executes all tasks, respecting dependencies and the parallelism cap.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DeadlockDetected`] when tasks remain pending
    /// with nothing running and nothing dispatchable.
    pub async fn execute_all(&mut self) -> Result<RunSummary, CoreError> {
        info!(
            tasks = self.config.tasks.len(),
            max_parallel = self.config.settings.max_parallel_tasks,
            "Starting parallel execution",
        );
        info!("\n{}", self.graph.render_ascii());
        emit(
            &self.progress,
            RunEvent::RunStarting {
                total: self.config.tasks.len(),
            },
        );

        let mut statuses: BTreeMap<String, TaskStatus> = BTreeMap::new();
        for task in &self.config.tasks {
            // Tasks recorded COMPLETED by a previous run are not re-dispatched.
            let status = match self.store.status_of(&task.name) {
                Some(TaskStatus::Completed) => {
                    info!(task = %task.name, "Already completed in recorded state; skipping");
                    TaskStatus::Completed
                }
                _ => TaskStatus::Pending,
            };
            statuses.insert(task.name.clone(), status);
        }

        let mut pool = ResourcePool::new(self.config.settings.max_parallel_tasks);
        let mut workers: JoinSet<(String, TaskReport)> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut halted = false;

        loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if halted {
                break;
            }

            self.promote(&mut statuses);

            let dispatched = self.dispatch(&mut statuses, &mut pool, &mut workers);

            let pending_remaining = statuses
                .values()
                .any(|s| matches!(s, TaskStatus::Pending | TaskStatus::Ready));

            if workers.is_empty() {
                if !pending_remaining {
                    break;
                }
                if dispatched == 0 {
                    let stuck: Vec<String> = statuses
                        .iter()
                        .filter(|(_, s)| matches!(s, TaskStatus::Pending | TaskStatus::Ready))
                        .map(|(name, _)| name.clone())
                        .collect();
                    error!(tasks = ?stuck, "Scheduler deadlock");
                    return Err(CoreError::DeadlockDetected(stuck));
                }
            }

            if dispatched == 0 && !workers.is_empty() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    joined = workers.join_next() => {
                        if let Some(joined) = joined {
                            halted |= self.reap(joined, &mut statuses, &mut pool, &mut summary);
                        }
                    }
                    () = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        if summary.cancelled {
            self.worker_cancel.cancel();
        }

        // Let in-flight workers wind down, then abandon stragglers.
        self.drain(&mut workers, &mut statuses, &mut pool, &mut summary)
            .await;
        self.finalize_remaining(&mut statuses, &summary);
        self.store.flush();

        let success = summary.success();
        emit(&self.progress, RunEvent::RunFinished { success });
        info!(
            completed = statuses.values().filter(|s| **s == TaskStatus::Completed).count(),
            failed = statuses.values().filter(|s| **s == TaskStatus::Failed).count(),
            skipped = statuses.values().filter(|s| **s == TaskStatus::Skipped).count(),
            "Parallel execution finished",
        );

        Ok(summary)
    }

    /// Marks newly-eligible tasks READY and cascades skips, to a fixpoint.
    ///
    /// A PENDING task with a FAILED or SKIPPED dependency becomes SKIPPED;
    /// the fixpoint loop carries the skip through entire subtrees in one
    /// scheduling iteration.
    fn promote(&self, statuses: &mut BTreeMap<String, TaskStatus>) {
        loop {
            let mut changed = false;

            for task in &self.config.tasks {
                if statuses[&task.name] != TaskStatus::Pending {
                    continue;
                }

                let failed_dep = task.depends_on.iter().find(|dep| {
                    matches!(
                        statuses.get(*dep),
                        Some(TaskStatus::Failed | TaskStatus::Skipped)
                    )
                });

                if let Some(dep) = failed_dep {
                    let reason = format!("dependency '{dep}' did not complete");
                    info!(task = %task.name, %dep, "Skipping task due to failed dependency");
                    statuses.insert(task.name.clone(), TaskStatus::Skipped);
                    self.store.mark_skipped(&task.name, &reason);
                    emit(
                        &self.progress,
                        RunEvent::TaskSkipped {
                            name: task.name.clone(),
                            reason,
                        },
                    );
                    changed = true;
                    continue;
                }

                let deps_completed = task
                    .depends_on
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&TaskStatus::Completed));
                if deps_completed {
                    debug!(task = %task.name, "Dependencies satisfied; task ready");
                    statuses.insert(task.name.clone(), TaskStatus::Ready);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Starts every READY task the pool admits, in declaration order.
    fn dispatch(
        &self,
        statuses: &mut BTreeMap<String, TaskStatus>,
        pool: &mut ResourcePool,
        workers: &mut JoinSet<(String, TaskReport)>,
    ) -> usize {
        let mut dispatched = 0;

        for task in &self.config.tasks {
            if statuses[&task.name] != TaskStatus::Ready {
                continue;
            }
            if !pool.can_schedule(task) {
                continue;
            }

            pool.allocate(task);
            statuses.insert(task.name.clone(), TaskStatus::Running);
            self.store.mark_dispatch(&task.name);
            emit(
                &self.progress,
                RunEvent::TaskStarting {
                    name: task.name.clone(),
                },
            );
            debug!(task = %task.name, running = pool.running_count(), "Dispatching task");

            let executor = self.executor.clone();
            let task = task.clone();
            workers.spawn(async move {
                let name = task.name.clone();
                let report = executor.execute(&task).await;
                (name, report)
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            info!(
                dispatched,
                running = pool.running_count(),
                "Scheduled tasks",
            );
        }
        dispatched
    }

    /// Processes one finished worker. Returns true when the run must halt.
    fn reap(
        &self,
        joined: Result<(String, TaskReport), tokio::task::JoinError>,
        statuses: &mut BTreeMap<String, TaskStatus>,
        pool: &mut ResourcePool,
        summary: &mut RunSummary,
    ) -> bool {
        let (name, report) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                // A panicked worker cannot be attributed to a task; its pool
                // slot stays held and the scheduler surfaces the stall as a
                // deadlock diagnostic instead of hanging.
                error!(error = %e, "Worker task failed to join");
                return false;
            }
        };

        if let Some(task) = self.config.task_by_name(&name) {
            pool.release(task);
        }

        let mut halt = false;
        if report.success {
            statuses.insert(name.clone(), TaskStatus::Completed);
            emit(
                &self.progress,
                RunEvent::TaskCompleted {
                    name: name.clone(),
                    attempts: report.attempts,
                },
            );
        } else {
            statuses.insert(name.clone(), TaskStatus::Failed);
            let error = report.error.clone().unwrap_or_else(|| "unknown".to_string());
            emit(
                &self.progress,
                RunEvent::TaskFailed {
                    name: name.clone(),
                    error,
                },
            );
            if report.fatal {
                warn!(task = %name, "Task requested stop; halting dispatch");
                self.worker_cancel.cancel();
                summary.stopped = true;
                halt = true;
            }
        }

        summary.reports.insert(name, report);
        halt
    }

    /// Reaps remaining workers within the grace period, then abandons them.
    async fn drain(
        &self,
        workers: &mut JoinSet<(String, TaskReport)>,
        statuses: &mut BTreeMap<String, TaskStatus>,
        pool: &mut ResourcePool,
        summary: &mut RunSummary,
    ) {
        if workers.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
        while !workers.is_empty() {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(joined)) => {
                    self.reap(joined, statuses, pool, summary);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = workers.len(),
                        "Grace period elapsed; abandoning workers",
                    );
                    workers.abort_all();
                    break;
                }
            }
        }

        // Whatever is still RUNNING was abandoned mid-flight.
        for (name, status) in statuses.iter_mut() {
            if *status == TaskStatus::Running {
                *status = TaskStatus::Failed;
                self.store.mark_attempt(
                    name,
                    false,
                    Some("cancelled before completion".to_string()),
                    None,
                );
                emit(
                    &self.progress,
                    RunEvent::TaskFailed {
                        name: name.clone(),
                        error: "cancelled before completion".to_string(),
                    },
                );
            }
        }
    }

    /// Marks tasks that never ran as SKIPPED once the run is cut short.
    fn finalize_remaining(
        &self,
        statuses: &mut BTreeMap<String, TaskStatus>,
        summary: &RunSummary,
    ) {
        let reason = if summary.stopped {
            "run stopped by failing task"
        } else if summary.cancelled {
            "run cancelled"
        } else {
            "never became ready"
        };

        for (name, status) in statuses.iter_mut() {
            if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
                *status = TaskStatus::Skipped;
                self.store.mark_skipped(name, reason);
                emit(
                    &self.progress,
                    RunEvent::TaskSkipped {
                        name: name.clone(),
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }
}

impl std::fmt::Debug for ParallelCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCoordinator")
            .field("tasks", &self.config.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    use async_stream::stream;
    use async_trait::async_trait;

    use prompter_agent::{Message, MessageStream, ResultMessage};

    use super::*;
    use crate::error::SessionError;
    use crate::session::AgentRequest;
    use crate::session::testing::{StubAgent, StubBehavior};
    use crate::state::DEFAULT_STATE_FILE;

    /// Records per-prompt activity intervals and peak concurrency.
    struct ProbeAgent {
        delay: Duration,
        active: Mutex<usize>,
        peak: Mutex<usize>,
        intervals: Mutex<HashMap<String, (Instant, Instant)>>,
    }

    impl ProbeAgent {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: Mutex::new(0),
                peak: Mutex::new(0),
                intervals: Mutex::new(HashMap::new()),
            }
        }

        fn peak(&self) -> usize {
            *self.peak.lock().unwrap()
        }

        fn overlap(&self, a: &str, b: &str) -> bool {
            let intervals = self.intervals.lock().unwrap();
            let (Some(&(a0, a1)), Some(&(b0, b1))) = (intervals.get(a), intervals.get(b)) else {
                return false;
            };
            a0 < b1 && b0 < a1
        }
    }

    #[async_trait]
    impl AgentClient for ProbeAgent {
        async fn open(&self, request: &AgentRequest) -> Result<MessageStream, SessionError> {
            let start = Instant::now();
            {
                let mut active = self.active.lock().unwrap();
                *active += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*active);
            }

            tokio::time::sleep(self.delay).await;

            {
                let mut active = self.active.lock().unwrap();
                *active -= 1;
            }
            self.intervals
                .lock()
                .unwrap()
                .insert(request.prompt.clone(), (start, Instant::now()));

            let s = stream! {
                yield Ok(Message::Result(ResultMessage {
                    subtype: "success".to_string(),
                    is_error: false,
                    num_turns: 1,
                    session_id: "sess-probe".to_string(),
                    total_cost_usd: None,
                    usage: None,
                    result: None,
                }));
            };
            Ok(Box::pin(s))
        }
    }

    fn config_from(toml: &str) -> PrompterConfig {
        let config = PrompterConfig::from_toml_str(toml).unwrap();
        assert!(config.validate().is_empty());
        config
    }

    fn store(dir: &tempfile::TempDir) -> Arc<StateStore> {
        Arc::new(StateStore::load(&dir.path().join(DEFAULT_STATE_FILE)).unwrap())
    }

    fn coordinator(
        config: PrompterConfig,
        store: Arc<StateStore>,
        client: Arc<dyn AgentClient>,
    ) -> ParallelCoordinator {
        ParallelCoordinator::new(config, store, client, CancellationToken::new(), false).unwrap()
    }

    const FOUR_INDEPENDENT: &str = r#"
[settings]
check_interval = 0
max_parallel_tasks = 2

[[tasks]]
name = "t1"
prompt = "do t1"
verify_command = "true"

[[tasks]]
name = "t2"
prompt = "do t2"
verify_command = "true"

[[tasks]]
name = "t3"
prompt = "do t3"
verify_command = "true"

[[tasks]]
name = "t4"
prompt = "do t4"
verify_command = "true"
"#;

    #[tokio::test]
    async fn test_should_cap_concurrent_tasks_at_max_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let probe = Arc::new(ProbeAgent::new(Duration::from_millis(60)));

        let mut config = config_from(FOUR_INDEPENDENT);
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), probe.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.success());
        assert_eq!(summary.reports.len(), 4);
        assert!(
            probe.peak() <= 2,
            "parallelism cap violated: peak {}",
            probe.peak()
        );
        assert_eq!(store.completed_tasks().len(), 4);
    }

    #[tokio::test]
    async fn test_should_cascade_skips_from_failed_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let agent = Arc::new(StubAgent::succeeding());

        let mut config = config_from(
            r#"
[settings]
check_interval = 0

[[tasks]]
name = "a"
prompt = "do a"
verify_command = "false"
max_attempts = 1

[[tasks]]
name = "b"
prompt = "do b"
verify_command = "true"
depends_on = ["a"]

[[tasks]]
name = "c"
prompt = "do c"
verify_command = "true"
depends_on = ["a"]

[[tasks]]
name = "d"
prompt = "do d"
verify_command = "true"
depends_on = ["c"]
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), agent.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert_eq!(summary.failed_count(), 1);
        let snap = store.snapshot();
        assert_eq!(snap.tasks["a"].status, TaskStatus::Failed);
        assert_eq!(snap.tasks["b"].status, TaskStatus::Skipped);
        assert_eq!(snap.tasks["c"].status, TaskStatus::Skipped);
        assert_eq!(snap.tasks["d"].status, TaskStatus::Skipped);

        // Only the failed root consulted the assistant.
        assert_eq!(agent.prompts(), vec!["do a".to_string()]);
    }

    #[tokio::test]
    async fn test_should_run_exclusive_task_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let probe = Arc::new(ProbeAgent::new(Duration::from_millis(50)));

        let mut config = config_from(
            r#"
[settings]
check_interval = 0
max_parallel_tasks = 4

[[tasks]]
name = "a"
prompt = "do a"
verify_command = "true"
exclusive = true

[[tasks]]
name = "b"
prompt = "do b"
verify_command = "true"

[[tasks]]
name = "c"
prompt = "do c"
verify_command = "true"
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), probe.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.success());
        assert!(!probe.overlap("do a", "do b"), "exclusive task overlapped b");
        assert!(!probe.overlap("do a", "do c"), "exclusive task overlapped c");
        assert_eq!(store.completed_tasks().len(), 3);
    }

    #[tokio::test]
    async fn test_should_skip_completed_tasks_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.mark_attempt("t1", true, None, Some("sess-old".to_string()));

        let agent = Arc::new(StubAgent::succeeding());
        let mut config = config_from(FOUR_INDEPENDENT);
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), agent.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.success());
        assert_eq!(summary.reports.len(), 3);
        let mut prompts = agent.prompts();
        prompts.sort();
        assert_eq!(prompts, vec!["do t2", "do t3", "do t4"]);
    }

    #[tokio::test]
    async fn test_should_halt_dispatch_when_stop_task_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let agent = Arc::new(StubAgent::succeeding());

        let mut config = config_from(
            r#"
[settings]
check_interval = 0
max_parallel_tasks = 1

[[tasks]]
name = "a"
prompt = "do a"
verify_command = "false"
on_failure = "stop"

[[tasks]]
name = "b"
prompt = "do b"
verify_command = "true"
depends_on = ["a"]

[[tasks]]
name = "c"
prompt = "do c"
verify_command = "true"
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), agent.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.stopped);
        assert!(!summary.success());
        let snap = store.snapshot();
        assert_eq!(snap.tasks["a"].status, TaskStatus::Failed);
        // b depends on the failed task, c simply never got dispatched.
        assert_eq!(snap.tasks["b"].status, TaskStatus::Skipped);
        assert!(matches!(
            snap.tasks.get("c").map(|s| s.status),
            None | Some(TaskStatus::Skipped)
        ));
    }

    #[tokio::test]
    async fn test_should_cancel_in_flight_workers_on_global_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let agent = Arc::new(StubAgent::stalling());

        let mut config = config_from(
            r#"
[settings]
check_interval = 0

[[tasks]]
name = "a"
prompt = "do a"
verify_command = "true"
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let cancel = CancellationToken::new();
        let mut coordinator =
            ParallelCoordinator::new(config, store.clone(), agent, cancel.clone(), false).unwrap();

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });

        let summary = coordinator.execute_all().await.unwrap();
        assert!(summary.cancelled);
        assert!(!summary.success());
        assert_eq!(store.snapshot().tasks["a"].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_should_retry_ready_tasks_blocked_by_full_pool() {
        // Regression guard: tasks marked READY while the pool was full must
        // be dispatched on a later iteration, not forgotten.
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let probe = Arc::new(ProbeAgent::new(Duration::from_millis(30)));

        let mut config = config_from(
            r#"
[settings]
check_interval = 0
max_parallel_tasks = 1

[[tasks]]
name = "root"
prompt = "do root"
verify_command = "true"

[[tasks]]
name = "w1"
prompt = "do w1"
verify_command = "true"
depends_on = ["root"]

[[tasks]]
name = "w2"
prompt = "do w2"
verify_command = "true"
depends_on = ["root"]

[[tasks]]
name = "w3"
prompt = "do w3"
verify_command = "true"
depends_on = ["root"]
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), probe.clone());
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.success());
        assert_eq!(store.completed_tasks().len(), 4);
        assert_eq!(probe.peak(), 1);
    }

    #[tokio::test]
    async fn test_should_recover_when_retry_succeeds_in_parallel_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let agent = Arc::new(StubAgent::succeeding());
        // First interaction for "a" dies; the retry succeeds.
        agent.push_behavior("do a", StubBehavior::Fail("transient".to_string()));

        let mut config = config_from(
            r#"
[settings]
check_interval = 0

[[tasks]]
name = "a"
prompt = "do a"
verify_command = "true"
on_failure = "retry"
max_attempts = 2

[[tasks]]
name = "b"
prompt = "do b"
verify_command = "true"
depends_on = ["a"]
"#,
        );
        config.settings.working_directory = Some(std::env::temp_dir());

        let mut coordinator = coordinator(config, store.clone(), agent);
        let summary = coordinator.execute_all().await.unwrap();

        assert!(summary.success());
        let snap = store.snapshot();
        assert_eq!(snap.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(snap.tasks["a"].attempts, 2);
        assert_eq!(snap.tasks["b"].status, TaskStatus::Completed);
    }
}
