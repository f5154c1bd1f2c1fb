//! Constellation editor -- the sole supported write path during execution.
//!
//! Every mutation is a named command built from a JSON parameter record.
//! The editor snapshots the constellation before applying, runs a full DAG
//! validation afterwards, and restores the snapshot when either the
//! command or the validation fails. Successful applies land on a bounded
//! undo stack; undo/redo swap snapshots, so `undo . apply` is always the
//! identity. Observers learn about successful mutations through
//! `CONSTELLATION_MODIFIED` events when a bus is attached.

pub mod commands;
pub mod registry;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;

use astral_graph::serialize::DocumentError;
use astral_graph::{Constellation, GraphError, IdAllocator};

use crate::bus::{Event, EventBus};

pub use commands::EditCommand;
pub use registry::{CommandBuilder, CommandRegistry};

/// Errors surfaced by editor operations.
#[derive(Debug, Error)]
pub enum EditorError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("invalid parameters for {command}: {message}")]
    InvalidParams { command: String, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("post-apply validation failed, command reverted: {0}")]
    PostValidation(String),

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,
}

struct HistoryEntry {
    command: String,
    snapshot: Constellation,
}

#[derive(Default)]
struct History {
    undo: VecDeque<HistoryEntry>,
    redo: VecDeque<HistoryEntry>,
}

/// Command-driven mutator with validation, rollback and bounded undo/redo.
pub struct ConstellationEditor {
    constellation: Arc<Mutex<Constellation>>,
    ids: Arc<IdAllocator>,
    registry: CommandRegistry,
    bus: Option<Arc<EventBus>>,
    history: StdMutex<History>,
    history_depth: usize,
}

impl ConstellationEditor {
    pub const DEFAULT_HISTORY_DEPTH: usize = 100;

    pub fn new(constellation: Arc<Mutex<Constellation>>, ids: Arc<IdAllocator>) -> Self {
        Self {
            constellation,
            ids,
            registry: CommandRegistry::standard(),
            bus: None,
            history: StdMutex::new(History::default()),
            history_depth: Self::DEFAULT_HISTORY_DEPTH,
        }
    }

    /// Attach a bus; successful applies/undos/redos publish
    /// `CONSTELLATION_MODIFIED` events.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the undo/redo stack bound (default 100).
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Register an additional command builder.
    pub fn register_command<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(Value) -> Result<Box<dyn EditCommand>, EditorError> + Send + Sync + 'static,
    {
        self.registry.register(name, builder);
    }

    pub fn command_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Shared handle to the constellation this editor mutates.
    pub fn constellation(&self) -> Arc<Mutex<Constellation>> {
        Arc::clone(&self.constellation)
    }

    pub fn undo_depth(&self) -> usize {
        self.history.lock().expect("editor history lock poisoned").undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.history.lock().expect("editor history lock poisoned").redo.len()
    }

    /// Apply a named command. The parameter record may carry an
    /// `on_task_id` field naming the completed task that triggered this
    /// edit; it is forwarded on the modification event so the synchronizer
    /// can clear its pending entry.
    pub async fn apply(&self, command_name: &str, params: Value) -> Result<Value, EditorError> {
        let on_task_id = params
            .get("on_task_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        // Validation-first: builders reject malformed records before any
        // state is touched.
        let mut command = self.registry.build(command_name, params)?;

        let mut constellation = self.constellation.lock().await;
        let snapshot = constellation.clone();

        let result = match command.apply(&mut constellation, &self.ids) {
            Ok(result) => result,
            Err(error) => {
                *constellation = snapshot;
                tracing::warn!(command = command_name, error = %error, "command failed, reverted");
                return Err(error);
            }
        };

        let problems = constellation.validate();
        if !problems.is_empty() {
            *constellation = snapshot;
            let message = problems.join("; ");
            tracing::warn!(command = command_name, problems = %message, "post-apply validation failed, reverted");
            return Err(EditorError::PostValidation(message));
        }

        {
            let mut history = self.history.lock().expect("editor history lock poisoned");
            history.undo.push_back(HistoryEntry {
                command: command_name.to_owned(),
                snapshot,
            });
            while history.undo.len() > self.history_depth {
                history.undo.pop_front();
            }
            history.redo.clear();
        }

        let constellation_id = constellation.constellation_id().to_owned();
        drop(constellation);

        tracing::info!(command = command_name, constellation_id = %constellation_id, "applied editor command");
        self.notify(&constellation_id, command_name, &result, on_task_id.as_deref());
        Ok(result)
    }

    /// Revert the most recent successful command.
    pub async fn undo(&self) -> Result<Value, EditorError> {
        let mut constellation = self.constellation.lock().await;
        let entry = {
            let mut history = self.history.lock().expect("editor history lock poisoned");
            history.undo.pop_back()
        }
        .ok_or(EditorError::NothingToUndo)?;

        let current = constellation.clone();
        *constellation = entry.snapshot;
        {
            let mut history = self.history.lock().expect("editor history lock poisoned");
            history.redo.push_back(HistoryEntry {
                command: entry.command.clone(),
                snapshot: current,
            });
            while history.redo.len() > self.history_depth {
                history.redo.pop_front();
            }
        }

        let constellation_id = constellation.constellation_id().to_owned();
        drop(constellation);

        let result = json!({ "undone": entry.command });
        self.notify(&constellation_id, "undo", &result, None);
        Ok(result)
    }

    /// Re-apply the most recently undone command.
    pub async fn redo(&self) -> Result<Value, EditorError> {
        let mut constellation = self.constellation.lock().await;
        let entry = {
            let mut history = self.history.lock().expect("editor history lock poisoned");
            history.redo.pop_back()
        }
        .ok_or(EditorError::NothingToRedo)?;

        let current = constellation.clone();
        *constellation = entry.snapshot;
        {
            let mut history = self.history.lock().expect("editor history lock poisoned");
            history.undo.push_back(HistoryEntry {
                command: entry.command.clone(),
                snapshot: current,
            });
            while history.undo.len() > self.history_depth {
                history.undo.pop_front();
            }
        }

        let constellation_id = constellation.constellation_id().to_owned();
        drop(constellation);

        let result = json!({ "redone": entry.command });
        self.notify(&constellation_id, "redo", &result, None);
        Ok(result)
    }

    fn notify(&self, constellation_id: &str, command: &str, result: &Value, on_task_id: Option<&str>) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::constellation_modified(
                constellation_id,
                command,
                result,
                on_task_id,
            ));
        }
    }
}
