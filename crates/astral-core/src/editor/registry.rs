//! Command registry -- a named collection of editor command builders.
//!
//! Commands are invoked by name with a JSON parameter record, so callers
//! (planners, replay harnesses, tests) never construct command structs
//! directly. The table is typed: each entry is a builder function that
//! parses the parameter record into a concrete command.

use std::collections::HashMap;

use serde_json::Value;

use super::EditorError;
use super::commands::{
    self, EditCommand,
};

/// Builder function: parse a parameter record into a command.
pub type CommandBuilder =
    Box<dyn Fn(Value) -> Result<Box<dyn EditCommand>, EditorError> + Send + Sync>;

/// A collection of registered command builders, keyed by command name.
pub struct CommandRegistry {
    builders: HashMap<String, CommandBuilder>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry pre-populated with the standard commands.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("add_task", commands::AddTask::build);
        registry.register("remove_task", commands::RemoveTask::build);
        registry.register("update_task", commands::UpdateTask::build);
        registry.register("add_dependency", commands::AddDependency::build);
        registry.register("remove_dependency", commands::RemoveDependency::build);
        registry.register("update_dependency", commands::UpdateDependency::build);
        registry.register("clear", commands::Clear::build);
        registry.register("bulk_build", commands::BulkBuild::build);
        registry.register("merge", commands::Merge::build);
        registry.register("subgraph", commands::Subgraph::build);
        registry.register("load", commands::Load::build);
        registry
    }

    /// Register a builder under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(Value) -> Result<Box<dyn EditCommand>, EditorError> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Build the named command from a parameter record.
    pub fn build(&self, name: &str, params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| EditorError::UnknownCommand(name.to_owned()))?;
        builder(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
