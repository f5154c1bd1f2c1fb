//! Modification synchronizer: orders planner edits against the scheduler.
//!
//! When a task finishes, the scheduler must not compute the next ready set
//! until the planner's edits for that completion have been applied. The
//! synchronizer tracks a pending entry per completed task and gates the
//! scheduling loop until the table drains or a timeout elapses.
//!
//! Entries are registered synchronously by the orchestrator at publication
//! time (registration is idempotent) and redundantly by this type's own
//! bus subscription; they are cleared by `CONSTELLATION_MODIFIED` events
//! carrying the originating `on_task_id`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::bus::{Event, EventKind, Observer};

/// Result of a gate wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pending table drained.
    Ready,
    /// The timeout elapsed; the table was cleared so the caller can
    /// proceed best-effort.
    TimedOut,
}

/// Counters and current pending ids, surfaced for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub pending: Vec<String>,
}

#[derive(Default)]
struct SyncState {
    pending: HashMap<String, DateTime<Utc>>,
    registered: u64,
    completed: u64,
    timed_out: u64,
}

/// Condition-variable-backed gate between task completion and scheduling.
///
/// Gating is armed with [`set_expect_modifications`]: deployments with a
/// planner arm it, and every completion then registers a pending entry
/// until the planner's `CONSTELLATION_MODIFIED` clears it. Without a
/// planner the gate stays vacuous and `wait_for_pending` returns
/// immediately.
///
/// [`set_expect_modifications`]: Self::set_expect_modifications
pub struct ModificationSynchronizer {
    state: Mutex<SyncState>,
    notify: Notify,
    timeout: Duration,
    expecting: AtomicBool,
}

impl ModificationSynchronizer {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            notify: Notify::new(),
            timeout,
            expecting: AtomicBool::new(false),
        }
    }

    /// Arm or disarm gating. Armed means a planner is listening and every
    /// task completion must wait for its reaction.
    pub fn set_expect_modifications(&self, enabled: bool) {
        self.expecting.store(enabled, Ordering::SeqCst);
    }

    pub fn expects_modifications(&self) -> bool {
        self.expecting.load(Ordering::SeqCst)
    }

    /// Register a pending modification for a just-finished task.
    /// Idempotent: an id already pending is left as-is and `false` is
    /// returned.
    pub fn register_pending(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().expect("synchronizer lock poisoned");
        if state.pending.contains_key(task_id) {
            return false;
        }
        state.pending.insert(task_id.to_owned(), Utc::now());
        state.registered += 1;
        tracing::debug!(task_id = %task_id, "registered pending modification");
        true
    }

    /// Clear the pending entry for a task, waking waiters. Unknown ids are
    /// a no-op (`false`), which also covers duplicate completions.
    pub fn complete_pending(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().expect("synchronizer lock poisoned");
        if state.pending.remove(task_id).is_none() {
            return false;
        }
        state.completed += 1;
        drop(state);
        self.notify.notify_waiters();
        tracing::debug!(task_id = %task_id, "completed pending modification");
        true
    }

    pub fn has_pending(&self) -> bool {
        !self
            .state
            .lock()
            .expect("synchronizer lock poisoned")
            .pending
            .is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("synchronizer lock poisoned")
            .pending
            .len()
    }

    /// Ids currently pending, sorted for deterministic assertions.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .expect("synchronizer lock poisoned")
            .pending
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Block until the pending table is empty or the configured timeout
    /// elapses.
    pub async fn wait_for_pending(&self) -> WaitOutcome {
        self.wait_for_pending_with(self.timeout).await
    }

    /// Block until the pending table is empty or `timeout` elapses. On
    /// timeout the table is cleared so the caller can proceed.
    pub async fn wait_for_pending_with(&self, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before checking so a completion between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if !self.has_pending() {
                return WaitOutcome::Ready;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock().expect("synchronizer lock poisoned");
                if state.pending.is_empty() {
                    return WaitOutcome::Ready;
                }
                let dropped: Vec<String> = state.pending.keys().cloned().collect();
                state.pending.clear();
                state.timed_out += 1;
                tracing::warn!(
                    dropped = ?dropped,
                    "synchronizer wait timed out; proceeding without planner edits"
                );
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Wake all waiters without changing the table (used by cancellation).
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock().expect("synchronizer lock poisoned");
        let mut pending: Vec<String> = state.pending.keys().cloned().collect();
        pending.sort();
        SyncStats {
            registered: state.registered,
            completed: state.completed,
            timed_out: state.timed_out,
            pending,
        }
    }
}

impl Default for ModificationSynchronizer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl Observer for ModificationSynchronizer {
    fn name(&self) -> &str {
        "modification-synchronizer"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        match event.kind {
            EventKind::TaskCompleted | EventKind::TaskFailed => {
                if self.expects_modifications() {
                    if let Some(task_id) = event.task_id() {
                        self.register_pending(task_id);
                    }
                }
            }
            EventKind::ConstellationModified => {
                if let Some(on_task_id) = event.on_task_id() {
                    self.complete_pending(on_task_id);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_with_no_pending_returns_immediately() {
        let sync = ModificationSynchronizer::default();
        assert_eq!(sync.wait_for_pending().await, WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn register_complete_wait_law() {
        let sync = ModificationSynchronizer::default();
        assert!(sync.register_pending("t1"));
        assert!(sync.complete_pending("t1"));
        assert_eq!(sync.wait_for_pending().await, WaitOutcome::Ready);

        let stats = sync.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.completed, 1);
        assert!(stats.pending.is_empty());
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let sync = ModificationSynchronizer::default();
        assert!(sync.register_pending("t1"));
        assert!(!sync.register_pending("t1"));
        assert_eq!(sync.pending_count(), 1);
        assert_eq!(sync.stats().registered, 1);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_completions_are_noops() {
        let sync = ModificationSynchronizer::default();
        sync.register_pending("t1");
        assert!(sync.complete_pending("t1"));
        assert!(!sync.complete_pending("t1"));
        assert!(!sync.complete_pending("never-registered"));
        assert_eq!(sync.stats().completed, 1);
    }

    #[tokio::test]
    async fn timeout_clears_table_and_reports() {
        let sync = ModificationSynchronizer::new(Duration::from_millis(50));
        sync.register_pending("stuck");

        let outcome = sync.wait_for_pending().await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(!sync.has_pending());
        assert_eq!(sync.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn waiter_wakes_when_last_pending_completes() {
        let sync = Arc::new(ModificationSynchronizer::default());
        sync.register_pending("t1");
        sync.register_pending("t2");

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait_for_pending().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        sync.complete_pending("t1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sync.complete_pending("t2");
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn unarmed_observer_ignores_completions() {
        use serde_json::json;

        let sync = ModificationSynchronizer::default();
        let completed = Event::task_completed("c1", "a", &json!("ok"), &[]);
        sync.on_event(&completed).await.unwrap();
        assert!(!sync.has_pending());
    }

    #[tokio::test]
    async fn observer_registers_and_clears_from_events() {
        use serde_json::json;

        let sync = ModificationSynchronizer::default();
        sync.set_expect_modifications(true);
        let completed = Event::task_completed("c1", "a", &json!("ok"), &[]);
        sync.on_event(&completed).await.unwrap();
        assert_eq!(sync.pending_ids(), vec!["a"]);

        let modified = Event::constellation_modified("c1", "add_task", &json!({}), Some("a"));
        sync.on_event(&modified).await.unwrap();
        assert!(!sync.has_pending());

        // A modified event for an unknown task is accepted silently.
        let unknown = Event::constellation_modified("c1", "noop", &json!({}), Some("ghost"));
        sync.on_event(&unknown).await.unwrap();
    }
}
