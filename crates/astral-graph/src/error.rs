//! Typed errors for constellation graph operations.

use thiserror::Error;

use crate::models::TaskStatus;

/// Broad classification of a [`GraphError`], used by callers that need to
/// distinguish error families without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Malformed input (bad enum value, missing required field).
    Validation,
    /// The mutation would violate a DAG invariant.
    Invariant,
    /// A referenced task or line does not exist.
    NotFound,
    /// The operation is illegal in the current task state.
    State,
}

/// Errors produced by constellation graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task {0:?} not found")]
    TaskNotFound(String),

    #[error("dependency line {0:?} not found")]
    LineNotFound(String),

    #[error("task {0:?} already exists")]
    DuplicateTask(String),

    #[error("equivalent dependency {from:?} -> {to:?} already exists")]
    DuplicateLine { from: String, to: String },

    #[error("dependency {from:?} -> {to:?} would create a cycle")]
    CycleDetected { from: String, to: String },

    #[error("dependency endpoint {0:?} does not exist")]
    DanglingEndpoint(String),

    #[error("graph contains a cycle")]
    GraphCyclic,

    #[error("cannot modify running task {0:?}")]
    TaskRunning(String),

    #[error("invalid status transition for task {task:?}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("cannot start task {0:?}: unsatisfied dependencies remain")]
    DependenciesUnsatisfied(String),

    #[error("cannot retry task {task:?}: attempt {current} >= retry budget {budget}")]
    RetryExhausted {
        task: String,
        current: u32,
        budget: u32,
    },

    #[error("id {0:?} already issued for this constellation")]
    IdCollision(String),

    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

impl GraphError {
    /// Classify this error into its broad [`GraphErrorKind`] family.
    pub fn kind(&self) -> GraphErrorKind {
        match self {
            Self::TaskNotFound(_) | Self::LineNotFound(_) => GraphErrorKind::NotFound,
            Self::DuplicateTask(_)
            | Self::DuplicateLine { .. }
            | Self::CycleDetected { .. }
            | Self::DanglingEndpoint(_)
            | Self::GraphCyclic
            | Self::TaskRunning(_)
            | Self::IdCollision(_) => GraphErrorKind::Invariant,
            Self::InvalidTransition { .. }
            | Self::DependenciesUnsatisfied(_)
            | Self::RetryExhausted { .. } => GraphErrorKind::State,
            Self::InvalidField { .. } => GraphErrorKind::Validation,
        }
    }
}
