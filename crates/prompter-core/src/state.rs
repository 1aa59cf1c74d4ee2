//! Durable run state: per-task status, session ids, and run metadata.
//!
//! The [`StateStore`] is the only shared mutable structure in a run. Every
//! read and write happens under one exclusive lock; persistence is a
//! temp-file write followed by an atomic rename, so a crash leaves either
//! the previous valid file or a stray `.tmp`, never a truncated target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Conventional state file name inside the working directory.
pub const DEFAULT_STATE_FILE: &str = ".prompter_state.json";

/// Lifecycle status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,
    /// All dependencies completed; eligible for dispatch.
    Ready,
    /// Currently executing.
    Running,
    /// Verification succeeded within the attempt budget.
    Completed,
    /// Attempt budget exhausted, stop triggered, or cancelled.
    Failed,
    /// A dependency failed, or loop protection refused re-entry.
    Skipped,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

// Lifecycle ordering, so statuses can key report maps.
impl Ord for TaskStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl PartialOrd for TaskStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dynamic state of one task.
///
/// The session identifier survives status changes and is never cleared;
/// a later resume may pick it up even from a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Attempts consumed so far.
    pub attempts: u32,

    /// Short description of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// AI session produced by the most recent attempt, success or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// When the most recent dispatch started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the most recent dispatch reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Times this task has been dispatched across the whole run.
    #[serde(default)]
    pub execution_count: u32,

    /// In-process update ordering for recency queries; not persisted.
    #[serde(skip)]
    seq: u64,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            session_id: None,
            started_at: None,
            ended_at: None,
            execution_count: 0,
            seq: 0,
        }
    }
}

/// Persisted document: run metadata plus the task state map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Identifier of this run.
    pub session_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the record was last written.
    pub last_updated_at: DateTime<Utc>,
    /// Per-task dynamic state.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskState>,
}

impl RunRecord {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            session_id: now.timestamp().to_string(),
            started_at: now,
            last_updated_at: now,
            tasks: BTreeMap::new(),
        }
    }

    /// Counts of tasks per status, for reporting.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for state in self.tasks.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }
}

struct StoreInner {
    record: RunRecord,
    next_seq: u64,
}

/// Lock-protected, crash-safe store for a run's state.
///
/// # Example
///
/// ```
/// use prompter_core::state::{StateStore, TaskStatus};
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join(".prompter_state.json");
///
/// let store = StateStore::load(&path).unwrap();
/// store.mark_attempt_start("build");
/// store.mark_attempt("build", true, None, Some("sess-1".to_string()));
///
/// let snapshot = store.snapshot();
/// assert_eq!(snapshot.tasks["build"].status, TaskStatus::Completed);
/// assert_eq!(snapshot.tasks["build"].attempts, 1);
/// ```
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl StateStore {
    /// Loads the record at `path`, or starts a fresh one if absent.
    ///
    /// Unknown fields in the file are tolerated; recency ordering is
    /// reconstructed from the recorded timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::State`] when the file exists but is malformed
    /// or has the wrong top-level type.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let mut record = if path.exists() {
            debug!(path = %path.display(), "Loading state file");
            let data = std::fs::read_to_string(path).map_err(|e| {
                CoreError::State(format!("Could not read state file {}: {e}", path.display()))
            })?;
            serde_json::from_str::<RunRecord>(&data).map_err(|e| {
                CoreError::State(format!(
                    "Malformed state file {}: {e}. Clear state to start fresh.",
                    path.display()
                ))
            })?
        } else {
            debug!(path = %path.display(), "No existing state file, starting fresh");
            RunRecord::fresh()
        };

        // Rebuild update ordering from timestamps so resume keeps the most
        // recently finished task first for session lookups.
        let mut ordered: Vec<(&String, Option<DateTime<Utc>>)> = record
            .tasks
            .iter()
            .map(|(name, st)| (name, st.ended_at.or(st.started_at)))
            .collect();
        ordered.sort_by_key(|(_, ts)| *ts);
        let order: Vec<String> = ordered.into_iter().map(|(n, _)| n.clone()).collect();
        let mut next_seq = 1;
        for name in order {
            if let Some(state) = record.tasks.get_mut(&name) {
                state.seq = next_seq;
                next_seq += 1;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(StoreInner { record, next_seq }),
        })
    }

    /// Path of the persisted file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run identifier.
    pub fn session_id(&self) -> String {
        self.inner.lock().expect("state lock").record.session_id.clone()
    }

    /// Drops recorded tasks that no longer exist in the configuration.
    ///
    /// A record may only be resumed when the configured task names are a
    /// superset of the recorded ones; unknown names are ignored with a
    /// warning rather than failing the run.
    pub fn reconcile_with_tasks(&self, task_names: &[&str]) {
        let mut inner = self.inner.lock().expect("state lock");
        let unknown: Vec<String> = inner
            .record
            .tasks
            .keys()
            .filter(|name| !task_names.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in unknown {
            warn!(task = %name, "State file records unknown task; ignoring");
            inner.record.tasks.remove(&name);
        }
    }

    /// Mutates one task's state under the lock, then persists.
    pub fn update<F>(&self, task_name: &str, mutate: F)
    where
        F: FnOnce(&mut TaskState),
    {
        let mut inner = self.inner.lock().expect("state lock");
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let state = inner.record.tasks.entry(task_name.to_string()).or_default();
        mutate(state);
        state.seq = seq;

        inner.record.last_updated_at = Utc::now();
        Self::save(&self.path, &inner.record);
    }

    /// Records a dispatch: status RUNNING, `execution_count` incremented.
    pub fn mark_dispatch(&self, task_name: &str) {
        self.update(task_name, |state| {
            state.status = TaskStatus::Running;
            state.execution_count += 1;
            state.started_at = Some(Utc::now());
            state.ended_at = None;
        });
    }

    /// Records the start of one attempt: status RUNNING, `attempts`
    /// incremented.
    pub fn mark_attempt_start(&self, task_name: &str) {
        self.update(task_name, |state| {
            state.status = TaskStatus::Running;
            state.attempts += 1;
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
        });
    }

    /// Records an attempt outcome.
    ///
    /// On success the status becomes COMPLETED and the error clears; on
    /// failure the status becomes FAILED and the error is captured. The
    /// session id, when present, is recorded either way and never cleared.
    pub fn mark_attempt(
        &self,
        task_name: &str,
        success: bool,
        error: Option<String>,
        session_id: Option<String>,
    ) {
        self.update(task_name, |state| {
            if let Some(id) = session_id {
                state.session_id = Some(id);
            }
            if success {
                state.status = TaskStatus::Completed;
                state.last_error = None;
            } else {
                state.status = TaskStatus::Failed;
                state.last_error = error;
            }
            state.ended_at = Some(Utc::now());
        });
    }

    /// Marks a task SKIPPED with a reason.
    pub fn mark_skipped(&self, task_name: &str, reason: &str) {
        let reason = reason.to_string();
        self.update(task_name, |state| {
            state.status = TaskStatus::Skipped;
            state.last_error = Some(reason);
            state.ended_at = Some(Utc::now());
        });
    }

    /// Immutable copy of the whole record, for reporters.
    pub fn snapshot(&self) -> RunRecord {
        self.inner.lock().expect("state lock").record.clone()
    }

    /// Current status of one task, if it has any recorded state.
    pub fn status_of(&self, task_name: &str) -> Option<TaskStatus> {
        self.inner
            .lock()
            .expect("state lock")
            .record
            .tasks
            .get(task_name)
            .map(|s| s.status)
    }

    /// Session id of the most recently updated task matching `predicate`.
    ///
    /// Failed tasks are eligible; callers that want only other tasks'
    /// sessions filter by name in the predicate.
    pub fn most_recent_session_id<F>(&self, predicate: F) -> Option<String>
    where
        F: Fn(&str, &TaskState) -> bool,
    {
        let inner = self.inner.lock().expect("state lock");
        inner
            .record
            .tasks
            .iter()
            .filter(|(name, state)| state.session_id.is_some() && predicate(name, state))
            .max_by_key(|(_, state)| state.seq)
            .and_then(|(_, state)| state.session_id.clone())
    }

    /// Names of tasks currently COMPLETED.
    pub fn completed_tasks(&self) -> Vec<String> {
        self.tasks_with_status(TaskStatus::Completed)
    }

    /// Names of tasks currently FAILED.
    pub fn failed_tasks(&self) -> Vec<String> {
        self.tasks_with_status(TaskStatus::Failed)
    }

    fn tasks_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.inner
            .lock()
            .expect("state lock")
            .record
            .tasks
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Deletes the persistent form and resets the in-memory record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] when the file exists but cannot be removed.
    pub fn clear(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("state lock");
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        inner.record = RunRecord::fresh();
        inner.next_seq = 1;
        debug!(path = %self.path.display(), "State cleared");
        Ok(())
    }

    /// Forces a write of the current record, e.g. before process exit.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.record.last_updated_at = Utc::now();
        Self::save(&self.path, &inner.record);
    }

    /// Serializes to `<path>.tmp`, then renames over the target.
    ///
    /// Write failures are logged, not returned; losing one checkpoint must
    /// not abort the run.
    fn save(path: &Path, record: &RunRecord) {
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        let json = match serde_json::to_string_pretty(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Could not serialize state");
                return;
            }
        };
        if let Err(e) = std::fs::write(&tmp, json) {
            warn!(error = %e, path = %tmp.display(), "Could not write state temp file");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            warn!(error = %e, path = %path.display(), "Could not replace state file");
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::load(&dir.path().join(DEFAULT_STATE_FILE)).unwrap()
    }

    #[test]
    fn test_should_start_fresh_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.snapshot().tasks.is_empty());
        assert!(!store.session_id().is_empty());
    }

    #[test]
    fn test_should_round_trip_record_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);

        let store = StateStore::load(&path).unwrap();
        store.mark_attempt_start("a");
        store.mark_attempt("a", true, None, Some("sess-1".to_string()));
        store.mark_attempt_start("b");
        store.mark_attempt("b", false, Some("boom".to_string()), Some("sess-2".to_string()));
        let before = store.snapshot();

        let reloaded = StateStore::load(&path).unwrap();
        let after = reloaded.snapshot();

        assert_eq!(after.session_id, before.session_id);
        assert_eq!(after.tasks.len(), 2);
        assert_eq!(after.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(after.tasks["a"].session_id.as_deref(), Some("sess-1"));
        assert_eq!(after.tasks["b"].status, TaskStatus::Failed);
        assert_eq!(after.tasks["b"].last_error.as_deref(), Some("boom"));
        assert_eq!(after.tasks["b"].attempts, 1);
    }

    #[test]
    fn test_should_reject_malformed_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(&path, "{not json").unwrap();

        let err = StateStore::load(&path).unwrap_err();
        assert!(matches!(err, CoreError::State(_)));
        assert!(err.to_string().contains("Malformed state file"));
    }

    #[test]
    fn test_should_reject_top_level_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        assert!(StateStore::load(&path).is_err());
    }

    #[test]
    fn test_should_tolerate_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(
            &path,
            r#"{
                "session_id": "123",
                "started_at": "2026-01-01T00:00:00Z",
                "last_updated_at": "2026-01-01T00:00:00Z",
                "future_field": {"anything": true},
                "tasks": {
                    "a": {"status": "completed", "attempts": 1, "extra": 7}
                }
            }"#,
        )
        .unwrap();

        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.status_of("a"), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_should_never_leave_partial_target_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        let store = StateStore::load(&path).unwrap();

        for i in 0..20 {
            store.mark_attempt(&format!("t{i}"), true, None, None);
            // The target must parse after every single write.
            let data = std::fs::read_to_string(&path).unwrap();
            serde_json::from_str::<RunRecord>(&data).unwrap();
        }
    }

    #[test]
    fn test_should_increment_attempts_and_execution_count_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.mark_dispatch("a");
        store.mark_attempt_start("a");
        store.mark_attempt_start("a");
        let snap = store.snapshot();
        assert_eq!(snap.tasks["a"].execution_count, 1);
        assert_eq!(snap.tasks["a"].attempts, 2);

        store.mark_dispatch("a");
        assert_eq!(store.snapshot().tasks["a"].execution_count, 2);
    }

    #[test]
    fn test_should_keep_session_id_across_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.mark_attempt("a", true, None, Some("sess-1".to_string()));
        store.mark_attempt("a", false, Some("broke".to_string()), None);

        let snap = store.snapshot();
        assert_eq!(snap.tasks["a"].status, TaskStatus::Failed);
        // The session id from the earlier attempt is never cleared.
        assert_eq!(snap.tasks["a"].session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_should_return_most_recent_session_matching_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.mark_attempt("a", true, None, Some("sess-a".to_string()));
        store.mark_attempt("b", false, Some("x".to_string()), Some("sess-b".to_string()));
        store.mark_attempt("c", true, None, None);

        // Most recent with any session id, excluding task "c" itself.
        let found = store.most_recent_session_id(|name, _| name != "c");
        assert_eq!(found.as_deref(), Some("sess-b"));

        // Excluding b falls back to a.
        let found = store.most_recent_session_id(|name, _| name != "b" && name != "c");
        assert_eq!(found.as_deref(), Some("sess-a"));

        let found = store.most_recent_session_id(|name, _| name == "c");
        assert!(found.is_none());
    }

    #[test]
    fn test_should_order_sessions_by_timestamp_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(
            &path,
            r#"{
                "session_id": "123",
                "started_at": "2026-01-01T00:00:00Z",
                "last_updated_at": "2026-01-01T01:00:00Z",
                "tasks": {
                    "early": {"status": "completed", "attempts": 1,
                              "session_id": "sess-early",
                              "ended_at": "2026-01-01T00:10:00Z"},
                    "late": {"status": "failed", "attempts": 1,
                             "session_id": "sess-late",
                             "ended_at": "2026-01-01T00:50:00Z"}
                }
            }"#,
        )
        .unwrap();

        let store = StateStore::load(&path).unwrap();
        let found = store.most_recent_session_id(|_, _| true);
        assert_eq!(found.as_deref(), Some("sess-late"));
    }

    #[test]
    fn test_should_drop_unknown_recorded_tasks_on_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.mark_attempt("kept", true, None, None);
        store.mark_attempt("renamed", true, None, None);

        store.reconcile_with_tasks(&["kept", "new"]);

        let snap = store.snapshot();
        assert!(snap.tasks.contains_key("kept"));
        assert!(!snap.tasks.contains_key("renamed"));
    }

    #[test]
    fn test_should_clear_state_file_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        let store = StateStore::load(&path).unwrap();
        store.mark_attempt("a", true, None, None);
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.snapshot().tasks.is_empty());
    }

    #[test]
    fn test_should_count_statuses_for_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.mark_attempt("a", true, None, None);
        store.mark_attempt("b", true, None, None);
        store.mark_attempt("c", false, Some("x".to_string()), None);
        store.mark_skipped("d", "dependency failed");

        let counts = store.snapshot().status_counts();
        assert_eq!(counts[&TaskStatus::Completed], 2);
        assert_eq!(counts[&TaskStatus::Failed], 1);
        assert_eq!(counts[&TaskStatus::Skipped], 1);
    }

    #[test]
    fn test_should_serialize_status_as_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let status: TaskStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(status, TaskStatus::Skipped);
    }
}
