//! Named predicate registry for conditional dependency lines.
//!
//! Conditional lines store a predicate *name* rather than a closure so they
//! stay serializable; the registry resolves names to evaluators at runtime.
//! Registration happens at startup, before any constellation executes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// A predicate over a prerequisite task's result (or error) payload.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A collection of registered predicates, keyed by name.
#[derive(Default)]
pub struct PredicateRegistry {
    predicates: RwLock<HashMap<String, Predicate>>,
}

impl PredicateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under `name`, replacing any previous entry.
    pub fn register<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates
            .write()
            .expect("predicate registry lock poisoned")
            .insert(name.into(), Arc::new(predicate));
    }

    /// Look up a predicate by name.
    pub fn get(&self, name: &str) -> Option<Predicate> {
        self.predicates
            .read()
            .expect("predicate registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates
            .read()
            .expect("predicate registry lock poisoned")
            .contains_key(name)
    }

    /// Names of all registered predicates, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .predicates
            .read()
            .expect("predicate registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("names", &self.names())
            .finish()
    }
}
