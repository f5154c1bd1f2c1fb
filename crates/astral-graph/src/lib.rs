//! In-memory DAG model for task constellations.
//!
//! A constellation is a DAG of tasks ("stars") joined by dependency lines.
//! This crate owns the data model and its invariants: status machines,
//! cycle-free mutation, readiness computation, topological metrics, id
//! allocation, named predicates for conditional lines, and the canonical
//! JSON document format. Execution lives in `astral-core`.

pub mod constellation;
pub mod error;
pub mod ids;
pub mod line;
pub mod models;
pub mod predicate;
pub mod serialize;
pub mod star;

pub use constellation::{Constellation, ConstellationSummary, MetricsMode, ParallelismMetrics};
pub use error::{GraphError, GraphErrorKind};
pub use ids::IdAllocator;
pub use line::StarLine;
pub use models::{ConstellationState, DependencyKind, DeviceType, TaskPriority, TaskStatus};
pub use predicate::{Predicate, PredicateRegistry};
pub use star::{AttemptOutcome, TaskStar};
