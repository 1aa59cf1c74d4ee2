//! Resource pool gating concurrent task starts.

use std::collections::BTreeSet;

use crate::config::TaskConfig;

/// Tracks running tasks against the parallelism cap and the exclusive flag.
///
/// Invariant: either an exclusive task is running alone, or no exclusive
/// task is running and at most `max_parallel_tasks` tasks are running.
///
/// # Example
///
/// ```
/// use prompter_core::config::TaskConfig;
/// use prompter_core::pool::ResourcePool;
///
/// let mut pool = ResourcePool::new(2);
/// let a = TaskConfig { name: "a".into(), ..Default::default() };
/// let b = TaskConfig { name: "b".into(), ..Default::default() };
/// let c = TaskConfig { name: "c".into(), ..Default::default() };
///
/// assert!(pool.can_schedule(&a));
/// pool.allocate(&a);
/// assert!(pool.can_schedule(&b));
/// pool.allocate(&b);
/// assert!(!pool.can_schedule(&c));
/// pool.release(&a);
/// assert!(pool.can_schedule(&c));
/// ```
#[derive(Debug)]
pub struct ResourcePool {
    max_parallel_tasks: usize,
    running: BTreeSet<String>,
    exclusive_running: Option<String>,
}

impl ResourcePool {
    /// Creates a pool with the given parallelism cap (must be ≥ 1).
    pub fn new(max_parallel_tasks: usize) -> Self {
        Self {
            max_parallel_tasks: max_parallel_tasks.max(1),
            running: BTreeSet::new(),
            exclusive_running: None,
        }
    }

    /// Number of currently running tasks.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether an exclusive task currently holds the pool.
    pub fn exclusive_active(&self) -> bool {
        self.exclusive_running.is_some()
    }

    /// Whether `task` may start right now.
    ///
    /// False while an exclusive task runs, when the cap is reached, or when
    /// the candidate is exclusive and anything else is running.
    pub fn can_schedule(&self, task: &TaskConfig) -> bool {
        if self.exclusive_running.is_some() {
            return false;
        }
        if self.running.len() >= self.max_parallel_tasks {
            return false;
        }
        !(task.exclusive && !self.running.is_empty())
    }

    /// Records `task` as running.
    pub fn allocate(&mut self, task: &TaskConfig) {
        self.running.insert(task.name.clone());
        if task.exclusive {
            self.exclusive_running = Some(task.name.clone());
        }
    }

    /// Releases `task`'s slot. Idempotent.
    pub fn release(&mut self, task: &TaskConfig) {
        self.running.remove(&task.name);
        if self.exclusive_running.as_deref() == Some(task.name.as_str()) {
            self.exclusive_running = None;
        }
    }
}
