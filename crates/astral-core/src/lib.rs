//! Runtime for executing task constellations across remote devices.
//!
//! The crate wires four subsystems around the `astral-graph` data model:
//!
//! - [`bus`]: process-local pub/sub delivering lifecycle events to
//!   observers on dedicated worker tasks.
//! - [`sync`]: the modification synchronizer gating each scheduling round
//!   until planner edits for a just-finished task have been applied.
//! - [`editor`]: the command-pattern write path with validation, rollback
//!   and bounded undo/redo.
//! - [`orchestrator`]: the scheduling loop dispatching ready tasks to
//!   devices through the [`device`] collaborator contract.

pub mod bus;
pub mod config;
pub mod device;
pub mod editor;
pub mod orchestrator;
pub mod sync;

pub use bus::{Event, EventBus, EventKind, Observer, SubscriberId};
pub use config::{CoreConfig, init_tracing};
pub use device::{
    AssignError, AssignRequest, AssignStrategy, DeviceBroker, DeviceInfo, ExecutionOutcome,
    TransportError,
};
pub use editor::{CommandRegistry, ConstellationEditor, EditCommand, EditorError};
pub use orchestrator::{
    ConstellationResult, ExecuteOptions, Orchestrator, OrchestratorConfig, OrchestratorError,
    TaskRecord,
};
pub use sync::{ModificationSynchronizer, SyncStats, WaitOutcome};
