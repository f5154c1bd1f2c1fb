//! DAG-aware orchestrator: runs a constellation to completion by
//! dispatching ready tasks to devices, enforcing a concurrency cap,
//! handling retries and timeouts, and gating each scheduling round on the
//! modification synchronizer so planner edits land before successors are
//! picked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use astral_graph::{
    AttemptOutcome, Constellation, ConstellationState, GraphError, PredicateRegistry, TaskStatus,
};
use chrono::{DateTime, Utc};

use crate::bus::{Event, EventBus};
use crate::device::assign::{self, AssignError, AssignStrategy};
use crate::device::{AssignRequest, DeviceBroker};
use crate::sync::{ModificationSynchronizer, WaitOutcome};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of concurrent in-flight tasks per constellation.
    pub max_parallel: usize,
    /// Per-task wall time limit when the task does not carry its own.
    pub default_task_timeout: Duration,
    /// How long each scheduling round waits for planner edits.
    pub sync_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            default_task_timeout: Duration::from_secs(1000),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub strategy: AssignStrategy,
    /// `task_id -> device_id` preferences, honored when connected.
    pub preferences: HashMap<String, String>,
    /// Override the configured concurrency cap for this run.
    pub max_parallel: Option<usize>,
}

/// Final record for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Result of running a constellation to completion.
#[derive(Debug, Clone, Serialize)]
pub struct ConstellationResult {
    pub constellation_id: String,
    pub status: ConstellationState,
    pub task_results: HashMap<String, TaskRecord>,
    pub metadata: serde_json::Map<String, Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `completed / (completed + failed)`; `None` when no task ran.
    pub success_rate: Option<f64>,
}

/// Errors that abort a run before the scheduling loop starts. Task
/// execution failures never surface here; they are captured on the tasks
/// and in the result record.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("constellation validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Assignment(#[from] AssignError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Message sent from spawned executions back to the scheduling loop.
struct ExecutionDone {
    task_id: String,
    outcome: ExecOutcome,
}

enum ExecOutcome {
    Success(Value),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

/// What the loop decided to do after inspecting the constellation.
enum RoundPlan {
    Finished,
    Stalled { stranded: Vec<String> },
    Spawn(Vec<SpawnSpec>),
}

struct SpawnSpec {
    task_id: String,
    device_id: Option<String>,
    description: String,
    payload: serde_json::Map<String, Value>,
    timeout: Duration,
}

#[derive(Clone)]
struct RunHandle {
    cancel: CancellationToken,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

/// The orchestrator. One instance can run many constellations over its
/// lifetime; each `execute` call drives one run.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    synchronizer: Arc<ModificationSynchronizer>,
    broker: Arc<dyn DeviceBroker>,
    predicates: Arc<PredicateRegistry>,
    config: OrchestratorConfig,
    /// Cancels every run when triggered.
    shutdown: CancellationToken,
    active: StdMutex<HashMap<String, RunHandle>>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        synchronizer: Arc<ModificationSynchronizer>,
        broker: Arc<dyn DeviceBroker>,
        predicates: Arc<PredicateRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            bus,
            synchronizer,
            broker,
            predicates,
            config,
            shutdown: CancellationToken::new(),
            active: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Cancel a running constellation. Signals the run's token, aborts
    /// in-flight executions at the transport level and wakes the
    /// synchronizer. Idempotent; unknown ids return `false`.
    pub async fn cancel(&self, constellation_id: &str) -> bool {
        let handle = {
            let active = self.active.lock().expect("orchestrator lock poisoned");
            active.get(constellation_id).cloned()
        };
        let Some(handle) = handle else {
            tracing::debug!(constellation_id = %constellation_id, "cancel for unknown constellation ignored");
            return false;
        };

        tracing::info!(constellation_id = %constellation_id, "cancelling constellation");
        handle.cancel.cancel();

        let in_flight: Vec<String> = {
            let set = handle.in_flight.lock().expect("in-flight lock poisoned");
            set.iter().cloned().collect()
        };
        let cancellations = in_flight.iter().map(|id| self.broker.cancel_task(id));
        for result in futures::future::join_all(cancellations).await {
            if let Err(error) = result {
                tracing::warn!(error = %error, "transport-level cancellation failed");
            }
        }

        self.synchronizer.wake();
        true
    }

    /// Cancel every run driven by this orchestrator.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
        self.synchronizer.wake();
    }

    /// Validate the constellation, assign devices, then drive the
    /// scheduling loop until every task is terminal, no task can become
    /// ready, or the run is cancelled.
    pub async fn execute(
        &self,
        constellation: Arc<Mutex<Constellation>>,
        opts: ExecuteOptions,
    ) -> Result<ConstellationResult, OrchestratorError> {
        // 1. Fail fast on an invalid DAG.
        let constellation_id = {
            let c = constellation.lock().await;
            let problems = c.validate();
            if !problems.is_empty() {
                return Err(OrchestratorError::Validation(problems.join("; ")));
            }
            c.constellation_id().to_owned()
        };

        let handle = RunHandle {
            cancel: self.shutdown.child_token(),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        };
        self.active
            .lock()
            .expect("orchestrator lock poisoned")
            .insert(constellation_id.clone(), handle.clone());

        let result = self
            .run(&constellation_id, constellation, opts, handle)
            .await;

        self.active
            .lock()
            .expect("orchestrator lock poisoned")
            .remove(&constellation_id);
        result
    }

    async fn run(
        &self,
        constellation_id: &str,
        constellation: Arc<Mutex<Constellation>>,
        opts: ExecuteOptions,
        handle: RunHandle,
    ) -> Result<ConstellationResult, OrchestratorError> {
        // 2. Ensure every task has a device assignment.
        {
            let mut c = constellation.lock().await;
            if !assign::unassigned_tasks(&c).is_empty() {
                assign::assign_devices(
                    &mut c,
                    self.broker.as_ref(),
                    opts.strategy,
                    &opts.preferences,
                )
                .await?;
            }
        }

        // 3. Start the run.
        {
            let mut c = constellation.lock().await;
            c.start_execution();
        }
        self.bus.publish(Event::constellation_started(constellation_id));
        tracing::info!(constellation_id = %constellation_id, "constellation execution started");

        let cancel = handle.cancel.clone();
        let max_parallel = opts.max_parallel.unwrap_or(self.config.max_parallel).max(1);
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let (tx, mut rx) = mpsc::channel::<ExecutionDone>(max_parallel * 2);
        let mut in_flight_count = 0usize;
        let mut announced_ready: HashSet<String> = HashSet::new();
        let mut stranded: Vec<String> = Vec::new();
        let mut was_cancelled = false;

        // 4. Scheduling loop.
        loop {
            // 4a. Cancellation check.
            if cancel.is_cancelled() {
                was_cancelled = true;
                self.drain_cancelled(
                    constellation_id,
                    &constellation,
                    &mut rx,
                    &mut in_flight_count,
                    &handle,
                )
                .await;
                break;
            }

            // 4b. Let in-flight planner edits land before scheduling.
            tokio::select! {
                outcome = self.synchronizer.wait_for_pending_with(self.config.sync_timeout) => {
                    if outcome == WaitOutcome::TimedOut {
                        tracing::warn!(
                            constellation_id = %constellation_id,
                            "proceeding without planner edits after synchronizer timeout"
                        );
                    }
                }
                _ = cancel.cancelled() => continue,
            }

            // 4c. Re-read the (possibly edited) constellation and decide.
            let plan = {
                let mut c = constellation.lock().await;
                if c.is_complete() {
                    RoundPlan::Finished
                } else {
                    let ready = c.ready_tasks(&self.predicates);
                    if ready.is_empty() && in_flight_count == 0 {
                        let stuck: Vec<String> = c
                            .tasks_in_order()
                            .into_iter()
                            .filter(|t| !t.is_terminal())
                            .map(|t| t.task_id().to_owned())
                            .collect();
                        RoundPlan::Stalled { stranded: stuck }
                    } else {
                        let mut specs = Vec::new();
                        for task_id in ready {
                            if semaphore.available_permits() <= specs.len() {
                                break;
                            }
                            if announced_ready.insert(task_id.clone()) {
                                self.bus
                                    .publish(Event::task_ready(constellation_id, &task_id));
                            }
                            match c.start_task(&task_id) {
                                Ok(()) => {}
                                Err(error) => {
                                    tracing::warn!(task_id = %task_id, error = %error, "could not start ready task");
                                    continue;
                                }
                            }
                            let task = c.task(&task_id).expect("task just started");
                            specs.push(SpawnSpec {
                                task_id: task_id.clone(),
                                device_id: task.target_device_id().map(str::to_owned),
                                description: task.request_string(),
                                payload: task.task_data().clone(),
                                timeout: task
                                    .timeout()
                                    .map(Duration::from_secs_f64)
                                    .unwrap_or(self.config.default_task_timeout),
                            });
                        }
                        RoundPlan::Spawn(specs)
                    }
                }
            };

            // 4d. Act on the plan.
            let specs = match plan {
                RoundPlan::Finished => break,
                RoundPlan::Stalled { stranded: stuck } => {
                    stranded = stuck;
                    break;
                }
                RoundPlan::Spawn(specs) => specs,
            };

            for spec in specs {
                let permit = semaphore
                    .clone()
                    .try_acquire_owned()
                    .expect("spawn count bounded by available permits");

                // Track before the event is observable so a cancel racing
                // the start still reaches the transport.
                handle
                    .in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .insert(spec.task_id.clone());
                in_flight_count += 1;

                self.bus
                    .publish(Event::task_started(constellation_id, &spec.task_id));
                tracing::info!(
                    constellation_id = %constellation_id,
                    task_id = %spec.task_id,
                    device_id = ?spec.device_id,
                    "task started"
                );

                let broker = Arc::clone(&self.broker);
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let task_id = spec.task_id.clone();
                    let outcome = execute_one(broker.as_ref(), spec, &cancel).await;
                    drop(permit);
                    let _ = tx.send(ExecutionDone { task_id, outcome }).await;
                });
            }

            // 4e. Wait for at least one completion, then drain what else
            // is already finished.
            if in_flight_count > 0 {
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight_count -= 1;
                            self.handle_done(constellation_id, &constellation, &handle, &mut announced_ready, done)
                                .await;
                        }
                    }
                    _ = cancel.cancelled() => continue,
                }
                while let Ok(done) = rx.try_recv() {
                    in_flight_count -= 1;
                    self.handle_done(constellation_id, &constellation, &handle, &mut announced_ready, done)
                        .await;
                }
            }
        }

        // 5. Close out the run.
        let result = {
            let mut c = constellation.lock().await;
            c.complete_execution();
            if !was_cancelled && !stranded.is_empty() {
                tracing::info!(
                    constellation_id = %constellation_id,
                    skipped = ?stranded,
                    "no task can become ready; finishing with skipped tasks"
                );
                c.mark_completed_with_skipped(&stranded);
            }
            build_result(&c)
        };

        let final_event = if was_cancelled {
            Event::constellation_cancelled(constellation_id)
        } else {
            match result.status {
                ConstellationState::Failed | ConstellationState::PartiallyFailed => {
                    Event::constellation_failed(constellation_id, &result.status.to_string())
                }
                _ => Event::constellation_completed(constellation_id, &result.status.to_string()),
            }
        };
        self.bus.publish(final_event);
        tracing::info!(
            constellation_id = %constellation_id,
            status = %result.status,
            "constellation execution finished"
        );

        Ok(result)
    }

    /// Handle one finished execution: advance the task's state, publish
    /// its terminal event and announce newly ready dependents. Graph-level
    /// surprises (e.g. the task was cancelled concurrently) are logged,
    /// never propagated.
    async fn handle_done(
        &self,
        constellation_id: &str,
        constellation: &Arc<Mutex<Constellation>>,
        handle: &RunHandle,
        announced_ready: &mut HashSet<String>,
        done: ExecutionDone,
    ) {
        handle
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&done.task_id);
        let task_id = done.task_id;

        match done.outcome {
            ExecOutcome::Success(result) => {
                let newly_ready = {
                    let mut c = constellation.lock().await;
                    match c.complete_task(
                        &task_id,
                        AttemptOutcome::Success(result.clone()),
                        &self.predicates,
                    ) {
                        Ok(newly_ready) => newly_ready,
                        Err(error) => {
                            tracing::warn!(task_id = %task_id, error = %error, "could not record task success");
                            return;
                        }
                    }
                };
                // When a planner is listening, gate the next scheduling
                // round on its reaction before the event is observable.
                if self.synchronizer.expects_modifications() {
                    self.synchronizer.register_pending(&task_id);
                }
                self.bus.publish(Event::task_completed(
                    constellation_id,
                    &task_id,
                    &result,
                    &newly_ready,
                ));
                tracing::info!(task_id = %task_id, "task completed");
                for ready_id in &newly_ready {
                    if announced_ready.insert(ready_id.clone()) {
                        self.bus
                            .publish(Event::task_ready(constellation_id, ready_id));
                    }
                }
            }
            ExecOutcome::Failed(error) => {
                self.handle_failure(constellation_id, constellation, announced_ready, &task_id, error)
                    .await;
            }
            ExecOutcome::TimedOut(timeout) => {
                // Timeouts are failures with a timeout reason.
                let error = format!("execution timed out after {:.1}s", timeout.as_secs_f64());
                self.handle_failure(constellation_id, constellation, announced_ready, &task_id, error)
                    .await;
            }
            ExecOutcome::Cancelled => {
                let changed = {
                    let mut c = constellation.lock().await;
                    c.cancel_task(&task_id).unwrap_or(false)
                };
                if changed {
                    self.bus
                        .publish(Event::task_cancelled(constellation_id, &task_id));
                    tracing::info!(task_id = %task_id, "task cancelled");
                }
            }
        }
    }

    /// Failed attempt: retry internally while budget remains (no event),
    /// otherwise record the terminal failure.
    async fn handle_failure(
        &self,
        constellation_id: &str,
        constellation: &Arc<Mutex<Constellation>>,
        announced_ready: &mut HashSet<String>,
        task_id: &str,
        error: String,
    ) {
        let retried = {
            let mut c = constellation.lock().await;
            let has_budget = c
                .task(task_id)
                .map(|t| t.current_retry() < t.retry_budget())
                .unwrap_or(false);
            if !has_budget {
                false
            } else {
                match c
                    .record_attempt_failure(task_id, error.clone())
                    .and_then(|()| c.retry_task(task_id))
                {
                    Ok(()) => {
                        let attempt = c.task(task_id).map(|t| t.current_retry()).unwrap_or(0);
                        tracing::info!(task_id = %task_id, attempt, error = %error, "task failed, retrying");
                        true
                    }
                    Err(graph_error) => {
                        tracing::warn!(task_id = %task_id, error = %graph_error, "could not retry failed task");
                        // The task is terminal or otherwise unretryable;
                        // leave it to the terminal path below.
                        false
                    }
                }
            }
        };

        if retried {
            // Internal retry: no event; the task re-enters the ready set
            // next round and is announced again.
            announced_ready.remove(task_id);
        } else {
            self.record_failure(constellation_id, constellation, announced_ready, task_id, error)
                .await;
        }
    }

    /// Terminal failure: record it, evaluate outgoing lines (completion
    /// gated dependents may unblock) and publish `TASK_FAILED`.
    async fn record_failure(
        &self,
        constellation_id: &str,
        constellation: &Arc<Mutex<Constellation>>,
        announced_ready: &mut HashSet<String>,
        task_id: &str,
        error: String,
    ) {
        let newly_ready = {
            let mut c = constellation.lock().await;
            match c.complete_task(
                task_id,
                AttemptOutcome::Failure(error.clone()),
                &self.predicates,
            ) {
                Ok(newly_ready) => newly_ready,
                Err(graph_error) => {
                    tracing::warn!(task_id = %task_id, error = %graph_error, "could not record task failure");
                    return;
                }
            }
        };
        if self.synchronizer.expects_modifications() {
            self.synchronizer.register_pending(task_id);
        }
        self.bus.publish(Event::task_failed(
            constellation_id,
            task_id,
            &error,
            &newly_ready,
        ));
        tracing::warn!(task_id = %task_id, error = %error, "task failed");
        for ready_id in &newly_ready {
            if announced_ready.insert(ready_id.clone()) {
                self.bus
                    .publish(Event::task_ready(constellation_id, ready_id));
            }
        }
    }

    /// Cancellation path: abort transports, drain in-flight executions,
    /// then cancel everything still active. After this the in-flight
    /// table is empty.
    async fn drain_cancelled(
        &self,
        constellation_id: &str,
        constellation: &Arc<Mutex<Constellation>>,
        rx: &mut mpsc::Receiver<ExecutionDone>,
        in_flight_count: &mut usize,
        handle: &RunHandle,
    ) {
        tracing::info!(
            constellation_id = %constellation_id,
            in_flight = *in_flight_count,
            "run cancelled, draining in-flight executions"
        );

        let in_flight: Vec<String> = {
            let set = handle.in_flight.lock().expect("in-flight lock poisoned");
            set.iter().cloned().collect()
        };
        let cancellations = in_flight.iter().map(|id| self.broker.cancel_task(id));
        for result in futures::future::join_all(cancellations).await {
            if let Err(error) = result {
                tracing::warn!(error = %error, "transport-level cancellation failed");
            }
        }

        let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while *in_flight_count > 0 {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(done)) => {
                    *in_flight_count -= 1;
                    handle
                        .in_flight
                        .lock()
                        .expect("in-flight lock poisoned")
                        .remove(&done.task_id);
                    let changed = {
                        let mut c = constellation.lock().await;
                        c.cancel_task(&done.task_id).unwrap_or(false)
                    };
                    if changed {
                        self.bus
                            .publish(Event::task_cancelled(constellation_id, &done.task_id));
                    }
                }
                _ => break,
            }
        }
        if *in_flight_count > 0 {
            tracing::warn!(
                constellation_id = %constellation_id,
                remaining = *in_flight_count,
                "drain timeout expired with executions still in flight"
            );
        }

        let cancelled = {
            let mut c = constellation.lock().await;
            c.cancel_all_active()
        };
        for task_id in &cancelled {
            self.bus
                .publish(Event::task_cancelled(constellation_id, task_id));
        }
        handle
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .clear();
    }
}

/// Run a single execution attempt against the broker, bounded by the
/// task's timeout and the run's cancellation token.
async fn execute_one(
    broker: &dyn DeviceBroker,
    spec: SpawnSpec,
    cancel: &CancellationToken,
) -> ExecOutcome {
    let Some(device_id) = spec.device_id else {
        return ExecOutcome::Failed(format!("no device assigned for task {}", spec.task_id));
    };

    let request = AssignRequest {
        task_id: spec.task_id.clone(),
        device_id,
        description: spec.description,
        payload: spec.payload,
        timeout: spec.timeout,
    };

    tokio::select! {
        _ = cancel.cancelled() => ExecOutcome::Cancelled,
        attempt = tokio::time::timeout(spec.timeout, broker.assign_task(request)) => {
            match attempt {
                Err(_elapsed) => ExecOutcome::TimedOut(spec.timeout),
                Ok(Err(transport_error)) => ExecOutcome::Failed(transport_error.to_string()),
                Ok(Ok(outcome)) if outcome.success => {
                    ExecOutcome::Success(outcome.result.unwrap_or(Value::Null))
                }
                Ok(Ok(outcome)) => ExecOutcome::Failed(
                    outcome.error.unwrap_or_else(|| "task failed".to_owned()),
                ),
            }
        }
    }
}

fn build_result(constellation: &Constellation) -> ConstellationResult {
    let mut task_results = HashMap::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    for task in constellation.tasks_in_order() {
        match task.status() {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed += 1,
            _ => {}
        }
        task_results.insert(
            task.task_id().to_owned(),
            TaskRecord {
                status: task.status(),
                result: task.result().cloned(),
                error: task.error().map(str::to_owned),
                start_time: task.execution_start_time(),
                end_time: task.execution_end_time(),
            },
        );
    }

    let status = if task_results.is_empty() {
        // An empty constellation runs vacuously to completion.
        ConstellationState::Completed
    } else {
        constellation.state()
    };

    let success_rate = if completed + failed > 0 {
        Some(completed as f64 / (completed + failed) as f64)
    } else {
        None
    };

    ConstellationResult {
        constellation_id: constellation.constellation_id().to_owned(),
        status,
        task_results,
        metadata: constellation.metadata().clone(),
        start_time: constellation.execution_start_time(),
        end_time: constellation.execution_end_time(),
        success_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel, 10);
        assert_eq!(config.default_task_timeout, Duration::from_secs(1000));
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
    }

    #[test]
    fn build_result_computes_success_rate() {
        use astral_graph::TaskStar;
        use serde_json::json;

        let registry = PredicateRegistry::new();
        let mut c = Constellation::new("c1", "r");
        c.add_task(TaskStar::new("a", "a")).unwrap();
        c.add_task(TaskStar::new("b", "b")).unwrap();
        c.complete_task("a", AttemptOutcome::Success(json!(1)), &registry)
            .unwrap();
        c.complete_task("b", AttemptOutcome::Failure("x".into()), &registry)
            .unwrap();

        let result = build_result(&c);
        assert_eq!(result.status, ConstellationState::PartiallyFailed);
        assert_eq!(result.success_rate, Some(0.5));
        assert_eq!(result.task_results.len(), 2);
    }

    #[test]
    fn empty_constellation_result_is_completed() {
        let c = Constellation::new("c1", "empty");
        let result = build_result(&c);
        assert_eq!(result.status, ConstellationState::Completed);
        assert!(result.task_results.is_empty());
        assert_eq!(result.success_rate, None);
    }
}
