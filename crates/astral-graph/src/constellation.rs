//! The constellation: a DAG of tasks and dependency lines.
//!
//! The constellation exclusively owns its tasks and lines in id-indexed
//! tables. The denormalized dependency/dependent sets on each task are
//! rebuilt here on every mutation, never by callers. All mutating
//! operations enforce the DAG invariants (no cycles, no dangling
//! endpoints, no edits to running tasks) before touching state.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::GraphError;
use crate::line::StarLine;
use crate::models::{ConstellationState, TaskStatus};
use crate::predicate::PredicateRegistry;
use crate::star::{AttemptOutcome, TaskStar};

/// Which inputs the parallelism metrics were computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsMode {
    /// No tasks.
    Empty,
    /// Structural estimate: nodes count as one unit of work each.
    NodeCount,
    /// All tasks terminal: measured execution durations.
    ActualTime,
}

/// Parallelism metrics: critical path length `L`, total work `W`, and the
/// parallelism ratio `P = W / L`.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelismMetrics {
    pub critical_path_length: f64,
    pub total_work: f64,
    pub parallelism_ratio: f64,
    pub mode: MetricsMode,
    pub critical_path_tasks: Vec<String>,
}

/// Compact description of a constellation for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConstellationSummary {
    pub constellation_id: String,
    pub name: String,
    pub state: ConstellationState,
    pub total_tasks: usize,
    pub total_lines: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub longest_path_length: usize,
    pub max_width: usize,
    pub metrics: ParallelismMetrics,
}

/// A DAG of tasks with lifecycle state and metadata.
#[derive(Debug, Clone)]
pub struct Constellation {
    pub(crate) constellation_id: String,
    pub(crate) name: String,
    pub(crate) state: ConstellationState,
    pub(crate) tasks: HashMap<String, TaskStar>,
    pub(crate) lines: HashMap<String, StarLine>,
    pub(crate) metadata: serde_json::Map<String, Value>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) execution_start_time: Option<DateTime<Utc>>,
    pub(crate) execution_end_time: Option<DateTime<Utc>>,
    pub(crate) next_ordinal: u64,
}

impl Constellation {
    /// Create an empty constellation.
    pub fn new(constellation_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            constellation_id: constellation_id.into(),
            name: name.into(),
            state: ConstellationState::Created,
            tasks: HashMap::new(),
            lines: HashMap::new(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            execution_start_time: None,
            execution_end_time: None,
            next_ordinal: 0,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn constellation_id(&self) -> &str {
        &self.constellation_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    pub fn state(&self) -> ConstellationState {
        self.state
    }

    pub fn metadata(&self) -> &serde_json::Map<String, Value> {
        &self.metadata
    }

    pub fn update_metadata(&mut self, metadata: serde_json::Map<String, Value>) {
        for (k, v) in metadata {
            self.metadata.insert(k, v);
        }
        self.touch();
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.execution_start_time
    }

    pub fn execution_end_time(&self) -> Option<DateTime<Utc>> {
        self.execution_end_time
    }

    /// Wall-clock duration of the whole run in seconds, when finished.
    pub fn execution_duration(&self) -> Option<f64> {
        match (self.execution_start_time, self.execution_end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskStar> {
        self.tasks.get(task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskStar> {
        self.tasks.get_mut(task_id)
    }

    pub fn line(&self, line_id: &str) -> Option<&StarLine> {
        self.lines.get(line_id)
    }

    pub fn line_mut(&mut self, line_id: &str) -> Option<&mut StarLine> {
        self.lines.get_mut(line_id)
    }

    /// Tasks in insertion order.
    pub fn tasks_in_order(&self) -> Vec<&TaskStar> {
        let mut tasks: Vec<&TaskStar> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.ordinal);
        tasks
    }

    /// Task ids in insertion order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks_in_order()
            .into_iter()
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// All lines, ordered by line id for determinism.
    pub fn lines_in_order(&self) -> Vec<&StarLine> {
        let mut lines: Vec<&StarLine> = self.lines.values().collect();
        lines.sort_by(|a, b| a.line_id.cmp(&b.line_id));
        lines
    }

    /// Lines ending at the given task.
    pub fn incoming_lines(&self, task_id: &str) -> Vec<&StarLine> {
        self.lines_in_order()
            .into_iter()
            .filter(|l| l.to_task_id == task_id)
            .collect()
    }

    /// Lines starting at the given task.
    pub fn outgoing_lines(&self, task_id: &str) -> Vec<&StarLine> {
        self.lines_in_order()
            .into_iter()
            .filter(|l| l.from_task_id == task_id)
            .collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // -- task and line mutation -------------------------------------------

    /// Add a task. Fails if the id is already present.
    pub fn add_task(&mut self, mut task: TaskStar) -> Result<(), GraphError> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(GraphError::DuplicateTask(task.task_id));
        }
        task.ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.tasks.insert(task.task_id.clone(), task);
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Remove a task and every incident line atomically. Fails if the task
    /// is absent or running.
    pub fn remove_task(&mut self, task_id: &str) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
        if task.status == TaskStatus::Running {
            return Err(GraphError::TaskRunning(task_id.to_owned()));
        }

        let incident: Vec<String> = self
            .lines
            .values()
            .filter(|l| l.from_task_id == task_id || l.to_task_id == task_id)
            .map(|l| l.line_id.clone())
            .collect();
        for line_id in incident {
            self.remove_line(&line_id);
        }

        self.tasks.remove(task_id);
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Add a dependency line. Fails if either endpoint is absent, an
    /// equivalent line (same endpoints) exists, or a cycle would result.
    pub fn add_line(&mut self, line: StarLine) -> Result<(), GraphError> {
        if !self.tasks.contains_key(&line.from_task_id) {
            return Err(GraphError::DanglingEndpoint(line.from_task_id));
        }
        if !self.tasks.contains_key(&line.to_task_id) {
            return Err(GraphError::DanglingEndpoint(line.to_task_id));
        }
        if self
            .lines
            .values()
            .any(|l| l.from_task_id == line.from_task_id && l.to_task_id == line.to_task_id)
        {
            return Err(GraphError::DuplicateLine {
                from: line.from_task_id,
                to: line.to_task_id,
            });
        }
        if self.would_create_cycle(&line.from_task_id, &line.to_task_id) {
            return Err(GraphError::CycleDetected {
                from: line.from_task_id,
                to: line.to_task_id,
            });
        }

        let from = line.from_task_id.clone();
        let to = line.to_task_id.clone();
        let satisfied = line.is_satisfied;
        self.lines.insert(line.line_id.clone(), line);

        if let Some(from_task) = self.tasks.get_mut(&from) {
            from_task.dependents.insert(to.clone());
        }
        if !satisfied {
            if let Some(to_task) = self.tasks.get_mut(&to) {
                to_task.dependencies.insert(from);
            }
        }

        self.touch();
        self.update_state();
        Ok(())
    }

    /// Remove a line, refreshing both endpoints. Absence is a no-op.
    pub fn remove_line(&mut self, line_id: &str) {
        let Some(line) = self.lines.remove(line_id) else {
            return;
        };
        if let Some(from_task) = self.tasks.get_mut(&line.from_task_id) {
            from_task.dependents.remove(&line.to_task_id);
        }
        if let Some(to_task) = self.tasks.get_mut(&line.to_task_id) {
            to_task.dependencies.remove(&line.from_task_id);
        }
        self.touch();
        self.update_state();
    }

    // -- execution state ---------------------------------------------------

    /// Start a task: requires `Pending` with an empty dependency set.
    pub fn start_task(&mut self, task_id: &str) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
        task.start_execution()?;
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Complete a task, evaluate its outgoing lines and clear satisfied
    /// entries from dependents' dependency sets. Auto-starts a `Pending`
    /// task when called directly. Returns the ids of dependents that just
    /// became ready, priority-ordered.
    pub fn complete_task(
        &mut self,
        task_id: &str,
        outcome: AttemptOutcome,
        predicates: &PredicateRegistry,
    ) -> Result<Vec<String>, GraphError> {
        {
            let task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
            if task.status == TaskStatus::Pending {
                task.start_execution()?;
            }
            match &outcome {
                AttemptOutcome::Success(result) => task.complete_with_success(result.clone())?,
                AttemptOutcome::Failure(error) => task.complete_with_failure(error.clone())?,
            }
        }

        let from_status = self.tasks[task_id].status;
        let payload = outcome.payload();

        let outgoing: Vec<String> = self
            .lines
            .values()
            .filter(|l| l.from_task_id == task_id)
            .map(|l| l.line_id.clone())
            .collect();

        let mut candidates: Vec<String> = Vec::new();
        for line_id in outgoing {
            let line = self.lines.get_mut(&line_id).expect("line just listed");
            let to = line.to_task_id.clone();
            if line.evaluate(from_status, &payload, predicates) {
                if let Some(dependent) = self.tasks.get_mut(&to) {
                    if dependent.status == TaskStatus::Pending {
                        dependent.dependencies.remove(task_id);
                        if !candidates.contains(&to) {
                            candidates.push(to);
                        }
                    }
                }
            }
        }

        let mut newly_ready: Vec<String> = candidates
            .into_iter()
            .filter(|id| self.is_ready(id))
            .collect();
        self.sort_by_schedule_order(&mut newly_ready);

        self.touch();
        self.update_state();
        Ok(newly_ready)
    }

    /// Record a failed attempt without evaluating outgoing lines, so an
    /// internal retry does not leak satisfaction to completion-gated
    /// dependents. Used by the scheduler's retry path.
    pub fn record_attempt_failure(
        &mut self,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
        task.complete_with_failure(error)?;
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Reset a failed task to `Pending` for another attempt.
    pub fn retry_task(&mut self, task_id: &str) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
        task.retry()?;
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Cancel a single task. Returns whether the status changed.
    pub fn cancel_task(&mut self, task_id: &str) -> Result<bool, GraphError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_owned()))?;
        let changed = task.cancel();
        if changed {
            self.touch();
            self.update_state();
        }
        Ok(changed)
    }

    /// Cancel every non-terminal task. Returns the affected ids in
    /// insertion order.
    pub fn cancel_all_active(&mut self) -> Vec<String> {
        let mut cancelled: Vec<String> = Vec::new();
        let ids = self.task_ids();
        for id in ids {
            let task = self.tasks.get_mut(&id).expect("task just listed");
            if task.cancel() {
                cancelled.push(id);
            }
        }
        if !cancelled.is_empty() {
            self.touch();
            self.update_state();
        }
        cancelled
    }

    // -- readiness ---------------------------------------------------------

    fn is_ready(&self, task_id: &str) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        task.is_ready_to_execute()
            && self
                .lines
                .values()
                .filter(|l| l.to_task_id == task_id)
                .all(|l| l.is_satisfied)
    }

    fn sort_by_schedule_order(&self, ids: &mut [String]) {
        ids.sort_by_key(|id| {
            let task = &self.tasks[id];
            (std::cmp::Reverse(task.priority), task.ordinal)
        });
    }

    /// Tasks that may start now: `Pending`, empty dependency set, every
    /// incoming line satisfied. Lines whose prerequisite reached a terminal
    /// status without being evaluated (e.g. lines added after the
    /// prerequisite finished) are evaluated lazily here, clearing the
    /// corresponding dependency entries. Result is sorted by priority
    /// descending, insertion order within equal priority.
    pub fn ready_tasks(&mut self, predicates: &PredicateRegistry) -> Vec<String> {
        // Lazy evaluation pass: settle unevaluated lines with terminal
        // prerequisites.
        let mut to_evaluate: Vec<(String, TaskStatus, Value)> = Vec::new();
        for line in self.lines.values() {
            if line.is_satisfied {
                continue;
            }
            if let Some(from) = self.tasks.get(&line.from_task_id) {
                if from.is_terminal() {
                    let payload = match from.status {
                        TaskStatus::Completed => {
                            from.result.clone().unwrap_or(Value::Null)
                        }
                        _ => from
                            .error
                            .clone()
                            .map(Value::String)
                            .unwrap_or(Value::Null),
                    };
                    to_evaluate.push((line.line_id.clone(), from.status, payload));
                }
            }
        }
        for (line_id, from_status, payload) in to_evaluate {
            let line = self.lines.get_mut(&line_id).expect("line just listed");
            let from = line.from_task_id.clone();
            let to = line.to_task_id.clone();
            if line.evaluate(from_status, &payload, predicates) {
                if let Some(dependent) = self.tasks.get_mut(&to) {
                    if dependent.status == TaskStatus::Pending {
                        dependent.dependencies.remove(&from);
                    }
                }
            }
        }

        let mut ready: Vec<String> = self
            .task_ids()
            .into_iter()
            .filter(|id| self.is_ready(id))
            .collect();
        self.sort_by_schedule_order(&mut ready);
        ready
    }

    /// Whether a task may be edited (pending, including the
    /// waiting-dependency alias). Unknown ids are not modifiable.
    pub fn is_task_modifiable(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .map(TaskStar::is_modifiable)
            .unwrap_or(false)
    }

    /// Ids of tasks that are safe to edit, in insertion order.
    pub fn modifiable_tasks(&self) -> Vec<String> {
        self.tasks_in_order()
            .into_iter()
            .filter(|t| t.is_modifiable())
            .map(|t| t.task_id().to_owned())
            .collect()
    }

    /// Ids of currently running tasks, in insertion order.
    pub fn running_tasks(&self) -> Vec<String> {
        self.tasks_in_order()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Whether every task is terminal. Vacuously true when empty.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.is_terminal())
    }

    // -- constellation state -----------------------------------------------

    /// Recompute the derived state from task statuses.
    pub fn update_state(&mut self) {
        if self.tasks.is_empty() {
            self.state = ConstellationState::Created;
            return;
        }

        let all_terminal = self.tasks.values().all(|t| t.is_terminal());
        let has_running = self
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Running);
        let has_completed = self
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Completed);
        let has_failed = self.tasks.values().any(|t| t.status == TaskStatus::Failed);
        let has_cancelled = self
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Cancelled);

        self.state = if all_terminal {
            // Cancellation dominates; PARTIALLY_FAILED applies only to a
            // completed/failed mix.
            if has_cancelled {
                ConstellationState::Cancelled
            } else if has_failed && has_completed {
                ConstellationState::PartiallyFailed
            } else if has_failed {
                ConstellationState::Failed
            } else {
                ConstellationState::Completed
            }
        } else if has_running || has_completed {
            ConstellationState::Executing
        } else {
            ConstellationState::Ready
        };
    }

    /// Mark the run as started.
    pub fn start_execution(&mut self) {
        self.state = ConstellationState::Executing;
        let now = Utc::now();
        self.execution_start_time = Some(now);
        self.updated_at = now;
    }

    /// Mark the run as finished and recompute the state.
    pub fn complete_execution(&mut self) {
        let now = Utc::now();
        self.execution_end_time = Some(now);
        self.updated_at = now;
        self.update_state();
    }

    /// Close out a run that stalled with unreachable pending tasks: the
    /// run counts as completed and the stranded ids are surfaced in
    /// `metadata["skipped_tasks"]`.
    pub fn mark_completed_with_skipped(&mut self, skipped: &[String]) {
        self.metadata.insert(
            "skipped_tasks".to_owned(),
            Value::Array(skipped.iter().cloned().map(Value::String).collect()),
        );
        self.state = ConstellationState::Completed;
        self.touch();
    }

    // -- validation and algorithms -----------------------------------------

    /// Check the DAG invariants. Returns human-readable problems; empty
    /// means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.has_cycle() {
            errors.push("graph contains a cycle".to_owned());
        }
        for line in self.lines_in_order() {
            if !self.tasks.contains_key(&line.from_task_id) {
                errors.push(format!(
                    "line {} references missing source task {}",
                    line.line_id, line.from_task_id
                ));
            }
            if !self.tasks.contains_key(&line.to_task_id) {
                errors.push(format!(
                    "line {} references missing target task {}",
                    line.line_id, line.to_task_id
                ));
            }
        }
        errors
    }

    /// Whether adding `from -> to` would close a cycle: true iff `from` is
    /// already reachable from `to`.
    fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![to];
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for line in self.lines.values() {
                if line.from_task_id == current {
                    stack.push(&line.to_task_id);
                }
            }
        }
        false
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }

    fn adjacency(&self) -> (HashMap<String, Vec<String>>, HashMap<String, usize>) {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        for id in self.task_ids() {
            adjacency.insert(id.clone(), Vec::new());
            in_degree.insert(id, 0);
        }
        for line in self.lines_in_order() {
            adjacency
                .get_mut(&line.from_task_id)
                .expect("endpoint validated on insert")
                .push(line.to_task_id.clone());
            *in_degree
                .get_mut(&line.to_task_id)
                .expect("endpoint validated on insert") += 1;
        }
        // Deterministic neighbor order: insertion order of the target task.
        for neighbors in adjacency.values_mut() {
            neighbors.sort_by_key(|id| self.tasks[id].ordinal);
        }
        (adjacency, in_degree)
    }

    /// Topological order via Kahn's algorithm. Errors if a cycle exists.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let (adjacency, mut in_degree) = self.adjacency();

        let mut queue: VecDeque<String> = self
            .task_ids()
            .into_iter()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(current) = queue.pop_front() {
            for neighbor in &adjacency[&current] {
                let degree = in_degree.get_mut(neighbor).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(neighbor.clone());
                }
            }
            order.push(current);
        }

        if order.len() != self.tasks.len() {
            return Err(GraphError::GraphCyclic);
        }
        Ok(order)
    }

    /// Longest path by node count: `(length, path)`. Ties broken by
    /// insertion order.
    pub fn longest_path(&self) -> (usize, Vec<String>) {
        if self.tasks.is_empty() {
            return (0, Vec::new());
        }
        let (distance, path) = self.longest_path_weighted(|_| 1.0);
        (distance.round() as usize, path)
    }

    /// Critical path weighted by measured execution durations (seconds).
    /// Meaningful once every task is terminal; tasks without a measured
    /// duration contribute zero.
    pub fn critical_path_by_time(&self) -> (f64, Vec<String>) {
        if self.tasks.is_empty() {
            return (0.0, Vec::new());
        }
        self.longest_path_weighted(|t| t.execution_duration().unwrap_or(0.0))
    }

    /// Topological DP over node weights with parent-pointer reconstruction.
    fn longest_path_weighted<F>(&self, weight: F) -> (f64, Vec<String>)
    where
        F: Fn(&TaskStar) -> f64,
    {
        let (adjacency, mut in_degree) = self.adjacency();

        let mut distance: HashMap<String, f64> = HashMap::new();
        let mut parent: HashMap<String, Option<String>> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for id in self.task_ids() {
            parent.insert(id.clone(), None);
            if in_degree[&id] == 0 {
                distance.insert(id.clone(), weight(&self.tasks[&id]));
                queue.push_back(id);
            } else {
                distance.insert(id, 0.0);
            }
        }

        while let Some(current) = queue.pop_front() {
            let current_distance = distance[&current];
            for neighbor in &adjacency[&current] {
                let candidate = current_distance + weight(&self.tasks[neighbor]);
                // Strictly-greater keeps the first (insertion-order) parent
                // on ties.
                if candidate > distance[neighbor] {
                    distance.insert(neighbor.clone(), candidate);
                    parent.insert(neighbor.clone(), Some(current.clone()));
                }
                let degree = in_degree.get_mut(neighbor).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(neighbor.clone());
                }
            }
        }

        let mut end: Option<&str> = None;
        let mut max_distance = 0.0_f64;
        for id in self.task_ids() {
            let d = distance[&id];
            if end.is_none() || d > max_distance {
                max_distance = d;
                end = Some(self.tasks[&id].task_id.as_str());
            }
        }

        let mut path = Vec::new();
        let mut cursor = end.map(str::to_owned);
        while let Some(id) = cursor {
            path.push(id.clone());
            cursor = parent[&id].clone();
        }
        path.reverse();

        (max_distance, path)
    }

    /// Maximum frontier size in a level-order traversal.
    pub fn max_width(&self) -> usize {
        if self.tasks.is_empty() {
            return 0;
        }
        let (adjacency, mut in_degree) = self.adjacency();
        let mut frontier: VecDeque<String> = self
            .task_ids()
            .into_iter()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut max_width = frontier.len();

        while !frontier.is_empty() {
            max_width = max_width.max(frontier.len());
            for _ in 0..frontier.len() {
                let current = frontier.pop_front().expect("non-empty frontier");
                for neighbor in &adjacency[&current] {
                    let degree = in_degree.get_mut(neighbor).expect("known node");
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.push_back(neighbor.clone());
                    }
                }
            }
        }
        max_width
    }

    /// Sum of measured execution durations, in seconds.
    pub fn total_work(&self) -> f64 {
        self.tasks
            .values()
            .filter_map(|t| t.execution_duration())
            .sum()
    }

    /// Parallelism metrics `L`, `W`, `P = W / L`. Uses measured times once
    /// all tasks are terminal, structural node counts otherwise.
    pub fn parallelism_metrics(&self) -> ParallelismMetrics {
        if self.tasks.is_empty() {
            return ParallelismMetrics {
                critical_path_length: 0.0,
                total_work: 0.0,
                parallelism_ratio: 0.0,
                mode: MetricsMode::Empty,
                critical_path_tasks: Vec::new(),
            };
        }

        if self.is_complete() {
            let (length, path) = self.critical_path_by_time();
            let work = self.total_work();
            ParallelismMetrics {
                critical_path_length: length,
                total_work: work,
                parallelism_ratio: if length > 0.0 { work / length } else { 0.0 },
                mode: MetricsMode::ActualTime,
                critical_path_tasks: path,
            }
        } else {
            let (length, path) = self.longest_path();
            let work = self.tasks.len() as f64;
            ParallelismMetrics {
                critical_path_length: length as f64,
                total_work: work,
                parallelism_ratio: if length > 0 { work / length as f64 } else { 0.0 },
                mode: MetricsMode::NodeCount,
                critical_path_tasks: path,
            }
        }
    }

    /// Reporting summary: counts, structure metrics and parallelism.
    pub fn summary(&self) -> ConstellationSummary {
        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        for task in self.tasks.values() {
            *status_counts.entry(task.status.to_string()).or_default() += 1;
        }
        let (longest_path_length, _) = self.longest_path();
        ConstellationSummary {
            constellation_id: self.constellation_id.clone(),
            name: self.name.clone(),
            state: self.state,
            total_tasks: self.tasks.len(),
            total_lines: self.lines.len(),
            status_counts,
            longest_path_length,
            max_width: self.max_width(),
            metrics: self.parallelism_metrics(),
        }
    }

    // -- structural operations ---------------------------------------------

    /// Merge another constellation into this one. Id collisions (task or
    /// line) are resolved by prefixing with `prefix`. Returns the ids of
    /// the tasks added, post-resolution.
    pub fn merge(&mut self, other: &Constellation, prefix: &str) -> Result<Vec<String>, GraphError> {
        let mut id_map: HashMap<String, String> = HashMap::new();
        for task in other.tasks_in_order() {
            let resolved = if self.tasks.contains_key(&task.task_id) {
                let prefixed = format!("{prefix}{}", task.task_id);
                if self.tasks.contains_key(&prefixed) {
                    return Err(GraphError::DuplicateTask(prefixed));
                }
                prefixed
            } else {
                task.task_id.clone()
            };
            id_map.insert(task.task_id.clone(), resolved);
        }

        let mut added = Vec::new();
        for task in other.tasks_in_order() {
            let mut copy = task.clone();
            copy.task_id = id_map[&task.task_id].clone();
            copy.dependencies.clear();
            copy.dependents.clear();
            self.add_task(copy)?;
            added.push(id_map[&task.task_id].clone());
        }

        for line in other.lines_in_order() {
            let mut copy = line.clone();
            copy.line_id = if self.lines.contains_key(&line.line_id) {
                format!("{prefix}{}", line.line_id)
            } else {
                line.line_id.clone()
            };
            copy.from_task_id = id_map[&line.from_task_id].clone();
            copy.to_task_id = id_map[&line.to_task_id].clone();
            self.add_line(copy)?;
        }

        self.rebuild_references();
        self.touch();
        self.update_state();
        Ok(added)
    }

    /// Project onto a task subset, keeping only lines with both endpoints
    /// inside. Fails if any requested id is unknown.
    pub fn subgraph(&self, task_ids: &[String]) -> Result<Constellation, GraphError> {
        let keep: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
        for id in task_ids {
            if !self.tasks.contains_key(id) {
                return Err(GraphError::TaskNotFound(id.clone()));
            }
        }

        let mut projection = Constellation::new(
            format!("{}_subgraph", self.constellation_id),
            format!("{} (subgraph)", self.name),
        );
        projection.metadata = self.metadata.clone();

        for task in self.tasks_in_order() {
            if keep.contains(task.task_id.as_str()) {
                let mut copy = task.clone();
                copy.dependencies.clear();
                copy.dependents.clear();
                projection.add_task(copy)?;
            }
        }
        for line in self.lines_in_order() {
            if keep.contains(line.from_task_id.as_str()) && keep.contains(line.to_task_id.as_str())
            {
                projection.add_line(line.clone())?;
            }
        }
        projection.rebuild_references();
        Ok(projection)
    }

    /// Remove every task and line. Fails while any task is running.
    pub fn clear(&mut self) -> Result<(), GraphError> {
        if let Some(running) = self
            .tasks
            .values()
            .find(|t| t.status == TaskStatus::Running)
        {
            return Err(GraphError::TaskRunning(running.task_id.clone()));
        }
        self.tasks.clear();
        self.lines.clear();
        self.touch();
        self.update_state();
        Ok(())
    }

    /// Rebuild every task's denormalized dependency/dependent sets from the
    /// line table. Dependency entries exist only for unsatisfied lines.
    pub fn rebuild_references(&mut self) {
        for task in self.tasks.values_mut() {
            task.dependencies.clear();
            task.dependents.clear();
        }
        let entries: Vec<(String, String, bool)> = self
            .lines
            .values()
            .map(|l| (l.from_task_id.clone(), l.to_task_id.clone(), l.is_satisfied))
            .collect();
        for (from, to, satisfied) in entries {
            if let Some(from_task) = self.tasks.get_mut(&from) {
                from_task.dependents.insert(to.clone());
            }
            if !satisfied {
                if let Some(to_task) = self.tasks.get_mut(&to) {
                    to_task.dependencies.insert(from);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;
    use serde_json::json;

    fn constellation_with(tasks: &[&str]) -> Constellation {
        let mut c = Constellation::new("c1", "test");
        for id in tasks {
            c.add_task(TaskStar::new(*id, *id)).unwrap();
        }
        c
    }

    fn line(id: &str, from: &str, to: &str) -> StarLine {
        StarLine::success_only(id, from, to)
    }

    #[test]
    fn add_task_rejects_duplicates() {
        let mut c = constellation_with(&["a"]);
        assert!(matches!(
            c.add_task(TaskStar::new("a", "again")),
            Err(GraphError::DuplicateTask(_))
        ));
    }

    #[test]
    fn add_line_validates_endpoints_and_duplicates() {
        let mut c = constellation_with(&["a", "b"]);
        assert!(matches!(
            c.add_line(line("l1", "a", "ghost")),
            Err(GraphError::DanglingEndpoint(_))
        ));
        c.add_line(line("l1", "a", "b")).unwrap();
        assert!(matches!(
            c.add_line(line("l2", "a", "b")),
            Err(GraphError::DuplicateLine { .. })
        ));
        assert_eq!(c.task("b").unwrap().dependencies().len(), 1);
        assert_eq!(c.task("a").unwrap().dependents().len(), 1);
    }

    #[test]
    fn cycle_is_rejected_before_mutation() {
        let mut c = constellation_with(&["a", "b", "c"]);
        c.add_line(line("l1", "a", "b")).unwrap();
        c.add_line(line("l2", "b", "c")).unwrap();
        let err = c.add_line(line("l3", "c", "a")).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
        // Constellation unchanged.
        assert_eq!(c.line_count(), 2);
        assert!(c.validate().is_empty());

        // Self-edge is a cycle too.
        assert!(matches!(
            c.add_line(line("l4", "a", "a")),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn remove_task_cascades_incident_lines() {
        let mut c = constellation_with(&["a", "b", "c"]);
        c.add_line(line("l1", "a", "b")).unwrap();
        c.add_line(line("l2", "b", "c")).unwrap();

        c.remove_task("b").unwrap();
        assert_eq!(c.line_count(), 0);
        assert!(c.task("a").unwrap().dependents().is_empty());
        assert!(c.task("c").unwrap().dependencies().is_empty());
    }

    #[test]
    fn remove_running_task_is_refused() {
        let mut c = constellation_with(&["a"]);
        c.start_task("a").unwrap();
        assert!(matches!(
            c.remove_task("a"),
            Err(GraphError::TaskRunning(_))
        ));
    }

    #[test]
    fn remove_line_tolerates_absence() {
        let mut c = constellation_with(&["a"]);
        c.remove_line("ghost");
    }

    #[test]
    fn complete_task_unblocks_dependents() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.add_line(line("l1", "a", "b")).unwrap();

        assert_eq!(c.ready_tasks(&registry), vec!["a"]);

        c.start_task("a").unwrap();
        let newly_ready = c
            .complete_task("a", AttemptOutcome::Success(json!("ok")), &registry)
            .unwrap();
        assert_eq!(newly_ready, vec!["b"]);
        assert!(c.task("b").unwrap().dependencies().is_empty());
        assert_eq!(c.ready_tasks(&registry), vec!["b"]);
    }

    #[test]
    fn success_only_line_blocks_on_failure() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.add_line(line("l1", "a", "b")).unwrap();

        c.start_task("a").unwrap();
        let newly_ready = c
            .complete_task("a", AttemptOutcome::Failure("boom".into()), &registry)
            .unwrap();
        assert!(newly_ready.is_empty());
        assert!(!c.ready_tasks(&registry).contains(&"b".to_string()));
    }

    #[test]
    fn completion_only_line_unblocks_on_failure() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.add_line(StarLine::completion_only("l1", "a", "b")).unwrap();

        c.start_task("a").unwrap();
        let newly_ready = c
            .complete_task("a", AttemptOutcome::Failure("boom".into()), &registry)
            .unwrap();
        assert_eq!(newly_ready, vec!["b"]);
    }

    #[test]
    fn record_attempt_failure_does_not_unblock_dependents() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.add_line(StarLine::completion_only("l1", "a", "b")).unwrap();
        c.task_mut("a").unwrap().set_retry_budget(1).unwrap();

        c.start_task("a").unwrap();
        c.record_attempt_failure("a", "transient").unwrap();
        // The completion-only line must not have been evaluated.
        assert!(!c.line("l1").unwrap().is_satisfied());
        assert!(!c.task("b").unwrap().dependencies().is_empty());

        c.retry_task("a").unwrap();
        assert_eq!(c.task("a").unwrap().status(), TaskStatus::Pending);
        assert_eq!(c.task("a").unwrap().current_retry(), 1);
    }

    #[test]
    fn conditional_line_gates_on_predicate() {
        let registry = PredicateRegistry::new();
        registry.register("has_errors", |v: &Value| {
            v.get("errors").and_then(Value::as_u64).unwrap_or(0) > 0
        });
        registry.register("no_errors", |v: &Value| {
            v.get("errors").and_then(Value::as_u64) == Some(0)
        });

        let mut c = constellation_with(&["scan", "cleanup", "deploy"]);
        c.add_line(StarLine::conditional(
            "l1", "scan", "cleanup", "errors found", "has_errors",
        ))
        .unwrap();
        c.add_line(StarLine::conditional(
            "l2", "scan", "deploy", "no errors", "no_errors",
        ))
        .unwrap();

        c.start_task("scan").unwrap();
        let newly_ready = c
            .complete_task(
                "scan",
                AttemptOutcome::Success(json!({"errors": 0})),
                &registry,
            )
            .unwrap();
        assert_eq!(newly_ready, vec!["deploy"]);
        assert!(!c.line("l1").unwrap().is_satisfied());
        assert!(c.line("l2").unwrap().is_satisfied());
        // cleanup stays blocked.
        assert_eq!(c.ready_tasks(&registry), vec!["deploy"]);
    }

    #[test]
    fn ready_tasks_orders_by_priority_then_insertion() {
        let registry = PredicateRegistry::new();
        let mut c = Constellation::new("c1", "test");
        c.add_task(TaskStar::new("first_low", "a").with_priority(TaskPriority::Low))
            .unwrap();
        c.add_task(TaskStar::new("critical", "b").with_priority(TaskPriority::Critical))
            .unwrap();
        c.add_task(TaskStar::new("second_low", "c").with_priority(TaskPriority::Low))
            .unwrap();

        assert_eq!(
            c.ready_tasks(&registry),
            vec!["critical", "first_low", "second_low"]
        );
    }

    #[test]
    fn ready_tasks_settles_lines_added_after_completion() {
        // A line added after its prerequisite finished must be evaluated
        // lazily so the dependent can still become ready.
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a"]);
        c.start_task("a").unwrap();
        c.complete_task("a", AttemptOutcome::Success(json!("ok")), &registry)
            .unwrap();

        c.add_task(TaskStar::new("late", "late")).unwrap();
        c.add_line(line("l1", "a", "late")).unwrap();
        assert!(!c.task("late").unwrap().dependencies().is_empty());

        assert_eq!(c.ready_tasks(&registry), vec!["late"]);
        assert!(c.task("late").unwrap().dependencies().is_empty());
    }

    #[test]
    fn state_derivation() {
        let registry = PredicateRegistry::new();
        let mut c = Constellation::new("c1", "test");
        assert_eq!(c.state(), ConstellationState::Created);

        c.add_task(TaskStar::new("a", "a")).unwrap();
        c.add_task(TaskStar::new("b", "b")).unwrap();
        assert_eq!(c.state(), ConstellationState::Ready);

        c.start_task("a").unwrap();
        assert_eq!(c.state(), ConstellationState::Executing);

        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        assert_eq!(c.state(), ConstellationState::Executing);

        c.complete_task("b", AttemptOutcome::Failure("x".into()), &registry)
            .unwrap();
        assert_eq!(c.state(), ConstellationState::PartiallyFailed);
    }

    #[test]
    fn cancelled_dominates_final_state() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        c.cancel_task("b").unwrap();
        assert_eq!(c.state(), ConstellationState::Cancelled);
    }

    #[test]
    fn all_failed_state() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a"]);
        c.complete_task("a", AttemptOutcome::Failure("x".into()), &registry)
            .unwrap();
        assert_eq!(c.state(), ConstellationState::Failed);
    }

    #[test]
    fn topological_order_linear() {
        let mut c = constellation_with(&["a", "b", "c"]);
        c.add_line(line("l1", "a", "b")).unwrap();
        c.add_line(line("l2", "b", "c")).unwrap();
        assert_eq!(c.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn longest_path_and_width_of_diamond() {
        let mut c = constellation_with(&["root", "left", "right", "join"]);
        c.add_line(line("l1", "root", "left")).unwrap();
        c.add_line(line("l2", "root", "right")).unwrap();
        c.add_line(line("l3", "left", "join")).unwrap();
        c.add_line(line("l4", "right", "join")).unwrap();

        let (length, path) = c.longest_path();
        assert_eq!(length, 3);
        assert_eq!(path.len(), 3);
        assert_eq!(path[0], "root");
        assert_eq!(path[2], "join");
        assert_eq!(c.max_width(), 2);
    }

    #[test]
    fn metrics_use_node_counts_before_completion() {
        let mut c = constellation_with(&["a", "b", "c"]);
        c.add_line(line("l1", "a", "b")).unwrap();

        let metrics = c.parallelism_metrics();
        assert_eq!(metrics.mode, MetricsMode::NodeCount);
        assert_eq!(metrics.critical_path_length, 2.0);
        assert_eq!(metrics.total_work, 3.0);
        assert!((metrics.parallelism_ratio - 1.5).abs() < 1e-9);
    }

    #[test]
    fn metrics_use_actual_time_when_all_terminal() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b"]);
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        c.complete_task("b", AttemptOutcome::Success(json!(2)), &registry)
            .unwrap();

        let metrics = c.parallelism_metrics();
        assert_eq!(metrics.mode, MetricsMode::ActualTime);
    }

    #[test]
    fn empty_metrics_mode() {
        let c = Constellation::new("c1", "test");
        assert_eq!(c.parallelism_metrics().mode, MetricsMode::Empty);
        assert_eq!(c.longest_path(), (0, vec![]));
        assert_eq!(c.max_width(), 0);
    }

    #[test]
    fn merge_resolves_collisions_by_prefix() {
        let mut target = constellation_with(&["a", "b"]);
        target.add_line(line("l1", "a", "b")).unwrap();

        let mut other = Constellation::new("c2", "other");
        other.add_task(TaskStar::new("a", "their a")).unwrap();
        other.add_task(TaskStar::new("z", "their z")).unwrap();
        other.add_line(line("l1", "a", "z")).unwrap();

        let added = target.merge(&other, "m_").unwrap();
        assert_eq!(added, vec!["m_a", "z"]);
        assert!(target.task("m_a").is_some());
        assert_eq!(target.task_count(), 4);
        assert_eq!(target.line_count(), 2);
        // The merged line now points at the renamed task.
        assert!(target.task("z").unwrap().dependencies().contains("m_a"));
    }

    #[test]
    fn subgraph_keeps_internal_lines_only() {
        let mut c = constellation_with(&["a", "b", "c"]);
        c.add_line(line("l1", "a", "b")).unwrap();
        c.add_line(line("l2", "b", "c")).unwrap();

        let sub = c.subgraph(&["a".into(), "b".into()]).unwrap();
        assert_eq!(sub.task_count(), 2);
        assert_eq!(sub.line_count(), 1);
        assert!(sub.line("l1").is_some());

        assert!(matches!(
            c.subgraph(&["ghost".into()]),
            Err(GraphError::TaskNotFound(_))
        ));
    }

    #[test]
    fn clear_refuses_running_tasks() {
        let mut c = constellation_with(&["a", "b"]);
        c.start_task("a").unwrap();
        assert!(matches!(c.clear(), Err(GraphError::TaskRunning(_))));

        let registry = PredicateRegistry::new();
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        c.clear().unwrap();
        assert_eq!(c.task_count(), 0);
        assert_eq!(c.state(), ConstellationState::Created);
    }

    #[test]
    fn cancel_all_active_spares_terminal_tasks() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b", "c"]);
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        c.start_task("b").unwrap();

        let cancelled = c.cancel_all_active();
        assert_eq!(cancelled, vec!["b", "c"]);
        assert_eq!(c.task("a").unwrap().status(), TaskStatus::Completed);
        assert_eq!(c.state(), ConstellationState::Cancelled);
    }

    #[test]
    fn mark_completed_with_skipped_records_metadata() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "stranded"]);
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();

        c.complete_execution();
        c.mark_completed_with_skipped(&["stranded".to_owned()]);
        assert_eq!(c.state(), ConstellationState::Completed);
        assert_eq!(
            c.metadata().get("skipped_tasks"),
            Some(&json!(["stranded"]))
        );
    }

    #[test]
    fn modifiable_tasks_exclude_running_and_terminal() {
        let registry = PredicateRegistry::new();
        let mut c = constellation_with(&["a", "b", "c"]);
        c.start_task("a").unwrap();
        c.complete_task("b", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();

        assert!(!c.is_task_modifiable("a"));
        assert!(!c.is_task_modifiable("b"));
        assert!(c.is_task_modifiable("c"));
        assert!(!c.is_task_modifiable("ghost"));
        assert_eq!(c.modifiable_tasks(), vec!["c"]);
    }

    #[test]
    fn validate_reports_cycles() {
        let mut c = constellation_with(&["a", "b"]);
        c.add_line(line("l1", "a", "b")).unwrap();
        assert!(c.validate().is_empty());
        // Force a bad edge in to exercise validation.
        c.lines
            .insert("bad".into(), StarLine::new("bad", "b", "ghost"));
        let errors = c.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ghost"));
    }
}
