//! Task dependency graph: validation and traversal primitives.
//!
//! Builds a DAG from the configured tasks and exposes the queries the
//! schedulers and diagnostics need: cycle detection (every cycle is
//! reported, not just the first), parallel execution levels, the critical
//! path, and the ready set for a given completion state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::config::TaskConfig;

/// One node in the dependency graph.
#[derive(Debug, Clone, Default)]
struct GraphNode {
    /// Names this task depends on.
    dependencies: BTreeSet<String>,
    /// Names that depend on this task.
    dependents: BTreeSet<String>,
}

/// DFS colors for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed acyclic graph over task names.
///
/// # Example
///
/// ```
/// use prompter_core::config::PrompterConfig;
///
/// let config = PrompterConfig::from_toml_str(r#"
///     [[tasks]]
///     name = "a"
///     prompt = "p"
///     verify_command = "true"
///
///     [[tasks]]
///     name = "b"
///     prompt = "p"
///     verify_command = "true"
///     depends_on = ["a"]
/// "#).unwrap();
///
/// let graph = config.build_graph().unwrap();
/// assert_eq!(graph.parallel_levels(), vec![
///     vec!["a".to_string()],
///     vec!["b".to_string()],
/// ]);
/// assert_eq!(graph.critical_path(), vec!["a".to_string(), "b".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// Kahn topological order, computed at build time.
    topological_order: Vec<String>,
}

impl TaskGraph {
    /// Builds and validates a graph from the task list.
    ///
    /// # Errors
    ///
    /// Returns every missing-dependency error and every cycle found, as
    /// human-readable strings.
    pub fn build(tasks: &[TaskConfig]) -> Result<Self, Vec<String>> {
        let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
        for task in tasks {
            nodes.entry(task.name.clone()).or_default().dependencies =
                task.depends_on.iter().cloned().collect();
        }

        let mut errors = Vec::new();

        // Missing dependencies first; edges to unknown names are dropped so
        // cycle detection still runs over the known subgraph.
        let known: BTreeSet<String> = nodes.keys().cloned().collect();
        for (name, node) in &mut nodes {
            for dep in node.dependencies.clone() {
                if !known.contains(&dep) {
                    errors.push(format!("Task '{name}' depends on undefined task '{dep}'"));
                    node.dependencies.remove(&dep);
                }
            }
        }

        // Reverse edges.
        let edges: Vec<(String, String)> = nodes
            .iter()
            .flat_map(|(name, node)| {
                node.dependencies
                    .iter()
                    .map(move |dep| (dep.clone(), name.clone()))
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.insert(dependent);
            }
        }

        let graph = Self {
            nodes,
            topological_order: Vec::new(),
        };

        for cycle in graph.find_cycles() {
            errors.push(format!(
                "Cycle detected in task dependencies: {}",
                cycle.join(" -> ")
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let topological_order = graph.compute_topological_order();
        debug!(tasks = topological_order.len(), "Task graph validated");

        Ok(Self {
            topological_order,
            ..graph
        })
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|n| n.dependencies.iter().map(String::as_str))
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|n| n.dependents.iter().map(String::as_str))
    }

    /// Finds every cycle via three-color DFS.
    ///
    /// A GRAY successor marks a back edge; the cycle path is collected and
    /// the search continues so that all cycles are reported.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut colors: BTreeMap<&str, Color> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), Color::White))
            .collect();
        let mut cycles = Vec::new();

        for start in self.nodes.keys() {
            if colors[start.as_str()] == Color::White {
                let mut path = Vec::new();
                self.dfs_cycles(start, &mut colors, &mut path, &mut cycles);
            }
        }

        cycles
    }

    fn dfs_cycles<'a>(
        &'a self,
        node: &'a str,
        colors: &mut BTreeMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colors.insert(node, Color::Gray);
        path.push(node);

        // Edges run dependency -> dependent, matching execution order.
        for neighbor in self.dependents_of(node) {
            match colors[neighbor] {
                Color::Gray => {
                    let start = path.iter().position(|&n| n == neighbor).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(neighbor.to_string());
                    cycles.push(cycle);
                }
                Color::White => self.dfs_cycles(neighbor, colors, path, cycles),
                Color::Black => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
    }

    /// Kahn's algorithm; only called once the graph is known acyclic.
    fn compute_topological_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.dependencies.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            for dependent in self.dependents_of(current) {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        order
    }

    /// Tasks grouped by execution level.
    ///
    /// Level *k* holds every task whose longest dependency chain from any
    /// source has length *k*; tasks within a level may run in parallel.
    pub fn parallel_levels(&self) -> Vec<Vec<String>> {
        let mut level: BTreeMap<&str, usize> = BTreeMap::new();
        for name in &self.topological_order {
            let depth = self
                .dependencies_of(name)
                .map(|dep| level.get(dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            level.insert(name.as_str(), depth);
        }

        let max_level = level.values().copied().max().map_or(0, |m| m + 1);
        let mut levels = vec![Vec::new(); max_level];
        for name in &self.topological_order {
            levels[level[name.as_str()]].push(name.clone());
        }
        levels
    }

    /// The longest dependency chain in the graph, in execution order.
    pub fn critical_path(&self) -> Vec<String> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let mut longest: BTreeMap<&str, usize> =
            self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        let mut parent: BTreeMap<&str, Option<&str>> =
            self.nodes.keys().map(|n| (n.as_str(), None)).collect();

        for task in &self.topological_order {
            for dependent in self.dependents_of(task) {
                if longest[task.as_str()] + 1 > longest[dependent] {
                    longest.insert(dependent, longest[task.as_str()] + 1);
                    parent.insert(dependent, Some(task.as_str()));
                }
            }
        }

        let end = longest
            .iter()
            .max_by_key(|(_, len)| **len)
            .map(|(name, _)| *name)
            .expect("non-empty graph");

        let mut path = Vec::new();
        let mut current = Some(end);
        while let Some(name) = current {
            path.push(name.to_string());
            current = parent[name];
        }
        path.reverse();
        path
    }

    /// Tasks whose dependencies are all in `completed` and none in `failed`,
    /// excluding tasks already in either set.
    pub fn ready(
        &self,
        completed: &BTreeSet<String>,
        failed: &BTreeSet<String>,
    ) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(name, _)| !completed.contains(*name) && !failed.contains(*name))
            .filter(|(_, node)| {
                node.dependencies.iter().all(|d| completed.contains(d))
                    && node.dependencies.iter().all(|d| !failed.contains(d))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// ASCII rendering of levels and the critical path, for run-start logs.
    pub fn render_ascii(&self) -> String {
        let mut lines = vec!["Task Dependency Graph:".to_string(), "=".repeat(30)];

        for (i, level) in self.parallel_levels().iter().enumerate() {
            lines.push(format!("Level {i} (can run in parallel):"));
            for task in level {
                let deps: Vec<&str> = self.dependencies_of(task).collect();
                if deps.is_empty() {
                    lines.push(format!("  {task} (no dependencies)"));
                } else {
                    lines.push(format!("  {task} <- {}", deps.join(", ")));
                }
            }
        }

        let critical = self.critical_path();
        if critical.len() > 1 {
            lines.push(format!("Critical Path: {}", critical.join(" -> ")));
        }

        lines.join("\n")
    }
}
