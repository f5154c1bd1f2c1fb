//! Shared test utilities for astral integration tests.
//!
//! Provides a scripted in-memory device broker (so orchestrator tests run
//! without any transport), an event recorder observer with await helpers,
//! and constellation fixtures for the common DAG shapes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use astral_core::bus::{Event, EventKind, Observer};
use astral_core::device::{
    AssignRequest, DeviceBroker, DeviceInfo, ExecutionOutcome, TransportError,
};
use astral_graph::{Constellation, DependencyKind, DeviceType, StarLine, TaskStar};

// ---------------------------------------------------------------------------
// Scripted broker
// ---------------------------------------------------------------------------

/// One scripted reaction of the broker to an `assign_task` call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Report success with the given result value.
    Succeed(Value),
    /// Report failure with the given error text.
    Fail(String),
    /// Never report; the execution parks until cancelled or timed out.
    Hang,
}

/// An in-memory [`DeviceBroker`] driven by per-task scripts.
///
/// Each `assign_task` call pops the next scripted outcome for the task
/// (falling back to success with `"ok"`), after an optional simulated
/// execution delay. Dispatches and transport-level cancellations are
/// logged for assertions.
pub struct ScriptedBroker {
    devices: Vec<DeviceInfo>,
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    dispatches: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedBroker {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            delay: Duration::from_millis(10),
            scripts: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Two `WINDOWS` devices, `d1` and `d2`.
    pub fn with_two_windows_devices() -> Self {
        Self::new(vec![
            DeviceInfo::new("d1", Some(DeviceType::Windows)),
            DeviceInfo::new("d2", Some(DeviceType::Windows)),
        ])
    }

    /// Simulated per-execution delay (default 10 ms).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append a scripted outcome for a task. Outcomes are consumed in
    /// order, one per attempt.
    pub fn script(&self, task_id: &str, outcome: ScriptedOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task_id.to_owned())
            .or_default()
            .push_back(outcome);
    }

    /// `(task_id, device_id)` pairs in dispatch order.
    pub fn dispatches(&self) -> Vec<(String, String)> {
        self.dispatches.lock().unwrap().clone()
    }

    /// Task ids for which transport-level cancellation was requested.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBroker for ScriptedBroker {
    async fn list_connected(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self.devices.clone())
    }

    async fn device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>, TransportError> {
        Ok(self
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn assign_task(
        &self,
        request: AssignRequest,
    ) -> Result<ExecutionOutcome, TransportError> {
        if !self.devices.iter().any(|d| d.device_id == request.device_id) {
            return Err(TransportError::NotConnected(request.device_id));
        }

        self.dispatches
            .lock()
            .unwrap()
            .push((request.task_id.clone(), request.device_id.clone()));

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Succeed(json!("ok")));

        tokio::time::sleep(self.delay).await;

        match outcome {
            ScriptedOutcome::Succeed(result) => {
                Ok(ExecutionOutcome::success(request.task_id, result))
            }
            ScriptedOutcome::Fail(error) => Ok(ExecutionOutcome::failure(request.task_id, error)),
            ScriptedOutcome::Hang => {
                // Park far beyond any test timeout; the orchestrator's
                // cancellation or timeout path reclaims the slot.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ExecutionOutcome::failure(request.task_id, "unreachable"))
            }
        }
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), TransportError> {
        self.cancelled.lock().unwrap().push(task_id.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event recorder
// ---------------------------------------------------------------------------

/// Observer that records every delivered event for later assertions.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    /// `(kind, task_id)` pairs for task-scoped events, in delivery order.
    pub fn task_timeline(&self) -> Vec<(EventKind, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.task_id().map(|id| (e.kind, id.to_owned())))
            .collect()
    }

    /// Task ids of recorded events of one kind, in delivery order.
    pub fn task_ids_of(&self, kind: EventKind) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.task_id().map(str::to_owned))
            .collect()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }

    /// Poll until at least `count` events of `kind` were recorded, or
    /// panic after `timeout`.
    pub async fn wait_for(&self, kind: EventKind, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count_of(kind) >= count {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {count} {kind} events; saw {:?}",
                    self.kinds()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Observer for EventRecorder {
    fn name(&self) -> &str {
        "event-recorder"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Constellation fixtures
// ---------------------------------------------------------------------------

/// A chain `ids[0] -> ids[1] -> ...` joined by lines of the given kind.
pub fn chain(constellation_id: &str, ids: &[&str], kind: DependencyKind) -> Constellation {
    let mut c = Constellation::new(constellation_id, constellation_id);
    for id in ids {
        c.add_task(TaskStar::new(*id, *id).with_description(format!("task {id}")))
            .unwrap();
    }
    for pair in ids.windows(2) {
        let line_id = format!("line_{}_{}", pair[0], pair[1]);
        c.add_line(StarLine::new(line_id, pair[0], pair[1]).with_kind(kind))
            .unwrap();
    }
    c
}

/// The diamond `root -> {left, right} -> join`, all success-only.
pub fn diamond(constellation_id: &str) -> Constellation {
    let mut c = Constellation::new(constellation_id, constellation_id);
    for id in ["root", "left", "right", "join"] {
        c.add_task(TaskStar::new(id, id).with_description(format!("task {id}")))
            .unwrap();
    }
    for (line_id, from, to) in [
        ("l1", "root", "left"),
        ("l2", "root", "right"),
        ("l3", "left", "join"),
        ("l4", "right", "join"),
    ] {
        c.add_line(StarLine::success_only(line_id, from, to)).unwrap();
    }
    c
}
