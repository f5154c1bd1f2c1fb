//! Stable, unique, human-readable id allocation.
//!
//! One allocator instance serves the whole process (via [`IdAllocator::global`])
//! but the type is plain and injectable so tests can run against their own
//! instance. Issuance is serialised behind a single mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::GraphError;

#[derive(Default)]
struct ConstellationIds {
    issued_tasks: HashSet<String>,
    issued_lines: HashSet<String>,
    task_counter: u64,
    line_counter: u64,
}

/// Allocator of task and line ids, scoped per constellation.
#[derive(Default)]
pub struct IdAllocator {
    inner: Mutex<HashMap<String, ConstellationIds>>,
}

static GLOBAL: OnceLock<IdAllocator> = OnceLock::new();

impl IdAllocator {
    /// A fresh allocator. Tests and embedders that want isolation use this.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide allocator instance.
    pub fn global() -> &'static IdAllocator {
        GLOBAL.get_or_init(IdAllocator::new)
    }

    /// Mint a new constellation id: `constellation_<8hex>_<yyyymmdd_hhmmss>`.
    pub fn new_constellation_id(&self) -> String {
        let hex = Uuid::new_v4().simple().to_string();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        format!("constellation_{}_{}", &hex[..8], stamp)
    }

    /// Issue the next `task_NNN` id for a constellation.
    pub fn next_task_id(&self, constellation_id: &str) -> String {
        let mut inner = self.inner.lock().expect("id allocator lock poisoned");
        let ids = inner.entry(constellation_id.to_owned()).or_default();
        loop {
            ids.task_counter += 1;
            let candidate = format!("task_{:03}", ids.task_counter);
            if ids.issued_tasks.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Issue the next `line_NNN` id for a constellation.
    pub fn next_line_id(&self, constellation_id: &str) -> String {
        let mut inner = self.inner.lock().expect("id allocator lock poisoned");
        let ids = inner.entry(constellation_id.to_owned()).or_default();
        loop {
            ids.line_counter += 1;
            let candidate = format!("line_{:03}", ids.line_counter);
            if ids.issued_lines.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Register a caller-supplied task id so future issuance avoids it.
    pub fn register_task_id(
        &self,
        constellation_id: &str,
        task_id: &str,
    ) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().expect("id allocator lock poisoned");
        let ids = inner.entry(constellation_id.to_owned()).or_default();
        if !ids.issued_tasks.insert(task_id.to_owned()) {
            return Err(GraphError::IdCollision(task_id.to_owned()));
        }
        Ok(())
    }

    /// Register a caller-supplied line id so future issuance avoids it.
    pub fn register_line_id(
        &self,
        constellation_id: &str,
        line_id: &str,
    ) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().expect("id allocator lock poisoned");
        let ids = inner.entry(constellation_id.to_owned()).or_default();
        if !ids.issued_lines.insert(line_id.to_owned()) {
            return Err(GraphError::IdCollision(line_id.to_owned()));
        }
        Ok(())
    }

    /// Drop all id state for a constellation.
    pub fn release_constellation(&self, constellation_id: &str) {
        self.inner
            .lock()
            .expect("id allocator lock poisoned")
            .remove(constellation_id);
    }
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("id allocator lock poisoned");
        f.debug_struct("IdAllocator")
            .field("constellations", &inner.len())
            .finish()
    }
}
