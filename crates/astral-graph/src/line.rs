//! Directed dependency lines between tasks.
//!
//! A line carries a satisfaction rule ([`DependencyKind`]), an optional
//! human-readable condition, and for conditional lines the name of a
//! predicate in the [`PredicateRegistry`]. Evaluation results are cached on
//! the line so readiness checks can consult the satisfaction flag without
//! re-running predicates.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{DependencyKind, TaskStatus};
use crate::predicate::PredicateRegistry;

/// A directed dependency between two tasks.
#[derive(Debug, Clone)]
pub struct StarLine {
    pub(crate) line_id: String,
    pub(crate) from_task_id: String,
    pub(crate) to_task_id: String,
    pub(crate) kind: DependencyKind,
    pub(crate) condition_description: String,
    pub(crate) predicate: Option<String>,
    pub(crate) metadata: serde_json::Map<String, Value>,
    pub(crate) is_satisfied: bool,
    pub(crate) last_evaluation_result: Option<bool>,
    pub(crate) last_evaluation_time: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl StarLine {
    /// Create a line with the given id and default (unconditional) kind.
    pub fn new(
        line_id: impl Into<String>,
        from_task_id: impl Into<String>,
        to_task_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            line_id: line_id.into(),
            from_task_id: from_task_id.into(),
            to_task_id: to_task_id.into(),
            kind: DependencyKind::Unconditional,
            condition_description: String::new(),
            predicate: None,
            metadata: serde_json::Map::new(),
            is_satisfied: false,
            last_evaluation_result: None,
            last_evaluation_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_kind(mut self, kind: DependencyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_condition(mut self, description: impl Into<String>) -> Self {
        self.condition_description = description.into();
        self
    }

    /// Attach the name of a registered predicate (conditional lines).
    pub fn with_predicate(mut self, name: impl Into<String>) -> Self {
        self.predicate = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Convenience constructor for a success-only line.
    pub fn success_only(
        line_id: impl Into<String>,
        from_task_id: impl Into<String>,
        to_task_id: impl Into<String>,
    ) -> Self {
        Self::new(line_id, from_task_id, to_task_id).with_kind(DependencyKind::SuccessOnly)
    }

    /// Convenience constructor for a completion-only line.
    pub fn completion_only(
        line_id: impl Into<String>,
        from_task_id: impl Into<String>,
        to_task_id: impl Into<String>,
    ) -> Self {
        Self::new(line_id, from_task_id, to_task_id).with_kind(DependencyKind::CompletionOnly)
    }

    /// Convenience constructor for a conditional line bound to a named
    /// predicate.
    pub fn conditional(
        line_id: impl Into<String>,
        from_task_id: impl Into<String>,
        to_task_id: impl Into<String>,
        condition: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        Self::new(line_id, from_task_id, to_task_id)
            .with_kind(DependencyKind::Conditional)
            .with_condition(condition)
            .with_predicate(predicate)
    }

    // -- accessors ---------------------------------------------------------

    pub fn line_id(&self) -> &str {
        &self.line_id
    }

    pub fn from_task_id(&self) -> &str {
        &self.from_task_id
    }

    pub fn to_task_id(&self) -> &str {
        &self.to_task_id
    }

    pub fn kind(&self) -> DependencyKind {
        self.kind
    }

    pub fn condition_description(&self) -> &str {
        &self.condition_description
    }

    pub fn predicate(&self) -> Option<&str> {
        self.predicate.as_deref()
    }

    pub fn metadata(&self) -> &serde_json::Map<String, Value> {
        &self.metadata
    }

    pub fn is_satisfied(&self) -> bool {
        self.is_satisfied
    }

    pub fn last_evaluation_result(&self) -> Option<bool> {
        self.last_evaluation_result
    }

    pub fn last_evaluation_time(&self) -> Option<DateTime<Utc>> {
        self.last_evaluation_time
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    // -- mutation ----------------------------------------------------------

    /// Change the satisfaction rule. Resets the cached satisfaction state.
    pub fn set_kind(&mut self, kind: DependencyKind) {
        self.kind = kind;
        self.reset_satisfaction();
    }

    pub fn set_condition_description(&mut self, description: impl Into<String>) {
        self.condition_description = description.into();
        self.updated_at = Utc::now();
    }

    /// Change the predicate name. Resets the cached satisfaction state.
    pub fn set_predicate(&mut self, name: Option<String>) {
        self.predicate = name;
        self.reset_satisfaction();
    }

    pub fn update_metadata(&mut self, metadata: serde_json::Map<String, Value>) {
        for (k, v) in metadata {
            self.metadata.insert(k, v);
        }
        self.updated_at = Utc::now();
    }

    /// Evaluate the satisfaction rule against the prerequisite's terminal
    /// status and its result (or error) payload. Caches the outcome.
    pub fn evaluate(
        &mut self,
        from_status: TaskStatus,
        payload: &Value,
        predicates: &PredicateRegistry,
    ) -> bool {
        let satisfied = match self.kind {
            DependencyKind::Unconditional | DependencyKind::CompletionOnly => {
                from_status.is_terminal()
            }
            DependencyKind::SuccessOnly => from_status == TaskStatus::Completed,
            DependencyKind::Conditional => match self.predicate.as_deref() {
                Some(name) => match predicates.get(name) {
                    Some(pred) => from_status.is_terminal() && pred(payload),
                    None => {
                        tracing::warn!(
                            line_id = %self.line_id,
                            predicate = %name,
                            "predicate not registered, degrading to success-only"
                        );
                        from_status == TaskStatus::Completed
                    }
                },
                None => from_status == TaskStatus::Completed,
            },
        };

        let now = Utc::now();
        self.last_evaluation_result = Some(satisfied);
        self.last_evaluation_time = Some(now);
        self.is_satisfied = satisfied;
        self.updated_at = now;
        satisfied
    }

    /// Manually mark the line satisfied, bypassing evaluation.
    pub fn mark_satisfied(&mut self) {
        let now = Utc::now();
        self.is_satisfied = true;
        self.last_evaluation_result = Some(true);
        self.last_evaluation_time = Some(now);
        self.updated_at = now;
    }

    /// Clear the cached satisfaction state.
    pub fn reset_satisfaction(&mut self) {
        self.is_satisfied = false;
        self.last_evaluation_result = None;
        self.last_evaluation_time = None;
        self.updated_at = Utc::now();
    }
}
