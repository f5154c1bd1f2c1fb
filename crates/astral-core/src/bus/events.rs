//! Lifecycle event records and the observer contract.
//!
//! Events carry a shared header (kind, source, timestamp) plus a JSON
//! payload. Payload accessors cover the fields the core itself consumes;
//! observers are free to read the raw `data`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// The closed set of lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ConstellationStarted,
    ConstellationCompleted,
    ConstellationFailed,
    ConstellationCancelled,
    ConstellationModified,
    TaskReady,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

impl EventKind {
    /// Every kind, in declaration order. Useful for subscribing to all.
    pub const ALL: [EventKind; 10] = [
        EventKind::ConstellationStarted,
        EventKind::ConstellationCompleted,
        EventKind::ConstellationFailed,
        EventKind::ConstellationCancelled,
        EventKind::ConstellationModified,
        EventKind::TaskReady,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskCancelled,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConstellationStarted => "CONSTELLATION_STARTED",
            Self::ConstellationCompleted => "CONSTELLATION_COMPLETED",
            Self::ConstellationFailed => "CONSTELLATION_FAILED",
            Self::ConstellationCancelled => "CONSTELLATION_CANCELLED",
            Self::ConstellationModified => "CONSTELLATION_MODIFIED",
            Self::TaskReady => "TASK_READY",
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskCancelled => "TASK_CANCELLED",
        };
        f.write_str(s)
    }
}

/// A lifecycle event: shared header plus a JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Id of the constellation (or component) that produced the event.
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, source_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn constellation_started(constellation_id: &str) -> Self {
        Self::new(EventKind::ConstellationStarted, constellation_id, json!({}))
    }

    pub fn constellation_completed(constellation_id: &str, state: &str) -> Self {
        Self::new(
            EventKind::ConstellationCompleted,
            constellation_id,
            json!({ "state": state }),
        )
    }

    pub fn constellation_failed(constellation_id: &str, state: &str) -> Self {
        Self::new(
            EventKind::ConstellationFailed,
            constellation_id,
            json!({ "state": state }),
        )
    }

    pub fn constellation_cancelled(constellation_id: &str) -> Self {
        Self::new(EventKind::ConstellationCancelled, constellation_id, json!({}))
    }

    /// A planner or editor mutation notice. `on_task_id` names the completed
    /// task whose handling triggered the edit, when there is one.
    pub fn constellation_modified(
        constellation_id: &str,
        command: &str,
        result: &Value,
        on_task_id: Option<&str>,
    ) -> Self {
        Self::new(
            EventKind::ConstellationModified,
            constellation_id,
            json!({
                "command": command,
                "result": result,
                "on_task_id": on_task_id,
            }),
        )
    }

    pub fn task_ready(constellation_id: &str, task_id: &str) -> Self {
        Self::new(
            EventKind::TaskReady,
            constellation_id,
            json!({ "task_id": task_id }),
        )
    }

    pub fn task_started(constellation_id: &str, task_id: &str) -> Self {
        Self::new(
            EventKind::TaskStarted,
            constellation_id,
            json!({ "task_id": task_id }),
        )
    }

    pub fn task_completed(
        constellation_id: &str,
        task_id: &str,
        result: &Value,
        newly_ready: &[String],
    ) -> Self {
        Self::new(
            EventKind::TaskCompleted,
            constellation_id,
            json!({
                "task_id": task_id,
                "result": result,
                "newly_ready": newly_ready,
            }),
        )
    }

    pub fn task_failed(
        constellation_id: &str,
        task_id: &str,
        error: &str,
        newly_ready: &[String],
    ) -> Self {
        Self::new(
            EventKind::TaskFailed,
            constellation_id,
            json!({
                "task_id": task_id,
                "error": error,
                "newly_ready": newly_ready,
            }),
        )
    }

    pub fn task_cancelled(constellation_id: &str, task_id: &str) -> Self {
        Self::new(
            EventKind::TaskCancelled,
            constellation_id,
            json!({ "task_id": task_id }),
        )
    }

    /// The `task_id` payload field, when present.
    pub fn task_id(&self) -> Option<&str> {
        self.data.get("task_id").and_then(Value::as_str)
    }

    /// The `on_task_id` payload field, when present.
    pub fn on_task_id(&self) -> Option<&str> {
        self.data.get("on_task_id").and_then(Value::as_str)
    }

    /// The `newly_ready` payload field, when present.
    pub fn newly_ready(&self) -> Vec<String> {
        self.data
            .get("newly_ready")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A bus subscriber. Implementations must be cheap to call; slow work
/// should be offloaded so the subscriber's delivery queue keeps draining.
#[async_trait::async_trait]
pub trait Observer: Send + Sync {
    /// Identity used in delivery-failure logs.
    fn name(&self) -> &str;

    /// Handle one event. Errors are logged and never stop delivery to
    /// other subscribers.
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}
