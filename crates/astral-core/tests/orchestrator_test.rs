//! End-to-end orchestrator tests over a scripted in-memory broker:
//! linear chains, diamond parallelism, retries, conditional gating,
//! cancellation and the empty-constellation boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use astral_core::bus::{EventBus, EventKind};
use astral_core::device::AssignStrategy;
use astral_core::orchestrator::{
    ExecuteOptions, Orchestrator, OrchestratorConfig, OrchestratorError,
};
use astral_core::sync::ModificationSynchronizer;
use astral_graph::{
    Constellation, ConstellationState, DependencyKind, PredicateRegistry, StarLine, TaskStar,
    TaskStatus,
};
use astral_test_utils::{EventRecorder, ScriptedBroker, ScriptedOutcome, chain, diamond};

struct Stack {
    bus: Arc<EventBus>,
    recorder: Arc<EventRecorder>,
    synchronizer: Arc<ModificationSynchronizer>,
    predicates: Arc<PredicateRegistry>,
    broker: Arc<ScriptedBroker>,
    orchestrator: Arc<Orchestrator>,
}

fn stack(broker: ScriptedBroker) -> Stack {
    let bus = Arc::new(EventBus::new());
    let recorder = EventRecorder::new();
    bus.subscribe(recorder.clone(), None);
    let synchronizer = Arc::new(ModificationSynchronizer::new(Duration::from_secs(5)));
    let predicates = Arc::new(PredicateRegistry::new());
    let broker = Arc::new(broker);
    let orchestrator = Arc::new(Orchestrator::new(
        bus.clone(),
        synchronizer.clone(),
        broker.clone(),
        predicates.clone(),
        OrchestratorConfig::default(),
    ));
    Stack {
        bus,
        recorder,
        synchronizer,
        predicates,
        broker,
        orchestrator,
    }
}

fn started_and_terminal(recorder: &EventRecorder) -> Vec<(EventKind, String)> {
    recorder
        .task_timeline()
        .into_iter()
        .filter(|(kind, _)| {
            matches!(
                kind,
                EventKind::TaskStarted
                    | EventKind::TaskCompleted
                    | EventKind::TaskFailed
                    | EventKind::TaskCancelled
            )
        })
        .collect()
}

#[tokio::test]
async fn linear_chain_success_path() {
    let stack = stack(ScriptedBroker::with_two_windows_devices());

    // a -> b success-only, b -> c unconditional.
    let mut c = Constellation::new("s1", "linear chain");
    for id in ["a", "b", "c"] {
        c.add_task(TaskStar::new(id, id)).unwrap();
    }
    c.add_line(StarLine::success_only("l1", "a", "b")).unwrap();
    c.add_line(StarLine::new("l2", "b", "c")).unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let preferences = HashMap::from([
        ("a".to_owned(), "d1".to_owned()),
        ("b".to_owned(), "d2".to_owned()),
        ("c".to_owned(), "d1".to_owned()),
    ]);
    let result = stack
        .orchestrator
        .execute(
            constellation.clone(),
            ExecuteOptions {
                strategy: AssignStrategy::RoundRobin,
                preferences,
                max_parallel: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Completed);
    for id in ["a", "b", "c"] {
        let record = &result.task_results[id];
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!("ok")));
    }
    assert_eq!(result.success_rate, Some(1.0));

    // Preferences were honored.
    assert_eq!(
        stack.broker.dispatches(),
        vec![
            ("a".to_owned(), "d1".to_owned()),
            ("b".to_owned(), "d2".to_owned()),
            ("c".to_owned(), "d1".to_owned()),
        ]
    );

    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    let kinds = stack.recorder.kinds();
    assert_eq!(kinds.first(), Some(&EventKind::ConstellationStarted));
    assert_eq!(kinds.last(), Some(&EventKind::ConstellationCompleted));
    assert_eq!(
        started_and_terminal(&stack.recorder),
        vec![
            (EventKind::TaskStarted, "a".to_owned()),
            (EventKind::TaskCompleted, "a".to_owned()),
            (EventKind::TaskStarted, "b".to_owned()),
            (EventKind::TaskCompleted, "b".to_owned()),
            (EventKind::TaskStarted, "c".to_owned()),
            (EventKind::TaskCompleted, "c".to_owned()),
        ]
    );

    // A fully serial chain has parallelism ratio 1.
    let metrics = constellation.lock().await.parallelism_metrics();
    assert!((metrics.parallelism_ratio - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn diamond_runs_branches_in_parallel() {
    let broker = ScriptedBroker::with_two_windows_devices().with_delay(Duration::from_millis(80));
    let stack = stack(broker);
    let constellation = Arc::new(Mutex::new(diamond("s2")));

    {
        let c = constellation.lock().await;
        assert_eq!(c.longest_path().0, 3);
        assert_eq!(c.max_width(), 2);
    }

    let result = stack
        .orchestrator
        .execute(
            constellation.clone(),
            ExecuteOptions {
                strategy: AssignStrategy::RoundRobin,
                preferences: HashMap::new(),
                max_parallel: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Completed);

    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    let timeline = started_and_terminal(&stack.recorder);
    let position = |kind: EventKind, id: &str| {
        timeline
            .iter()
            .position(|(k, t)| *k == kind && t == id)
            .unwrap_or_else(|| panic!("missing {kind} for {id}"))
    };

    // Both branches start before either finishes.
    let left_started = position(EventKind::TaskStarted, "left");
    let right_started = position(EventKind::TaskStarted, "right");
    let left_done = position(EventKind::TaskCompleted, "left");
    let right_done = position(EventKind::TaskCompleted, "right");
    assert!(left_started < left_done && left_started < right_done);
    assert!(right_started < left_done && right_started < right_done);

    // The join only starts after both branches completed.
    let join_started = position(EventKind::TaskStarted, "join");
    assert!(join_started > left_done && join_started > right_done);
}

#[tokio::test]
async fn transient_failure_retries_without_failure_event() {
    let broker = ScriptedBroker::with_two_windows_devices();
    broker.script("t", ScriptedOutcome::Fail("transient".into()));
    broker.script("t", ScriptedOutcome::Succeed(json!("ok")));
    let stack = stack(broker);

    let mut c = Constellation::new("s3", "retry");
    c.add_task(TaskStar::new("t", "t").with_retry_budget(2)).unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let result = stack
        .orchestrator
        .execute(constellation.clone(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Completed);
    assert_eq!(result.task_results["t"].status, TaskStatus::Completed);
    assert_eq!(result.task_results["t"].result, Some(json!("ok")));
    assert_eq!(constellation.lock().await.task("t").unwrap().current_retry(), 1);

    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    // Two attempts, one completion, and no failure event for the
    // internally retried attempt.
    assert_eq!(stack.recorder.count_of(EventKind::TaskStarted), 2);
    assert_eq!(stack.recorder.count_of(EventKind::TaskCompleted), 1);
    assert_eq!(stack.recorder.count_of(EventKind::TaskFailed), 0);
}

#[tokio::test]
async fn exhausted_retries_surface_as_failure() {
    let broker = ScriptedBroker::with_two_windows_devices();
    broker.script("t", ScriptedOutcome::Fail("first".into()));
    broker.script("t", ScriptedOutcome::Fail("second".into()));
    let stack = stack(broker);

    let mut c = Constellation::new("s3b", "retry exhausted");
    c.add_task(TaskStar::new("t", "t").with_retry_budget(1)).unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let result = stack
        .orchestrator
        .execute(constellation, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Failed);
    let record = &result.task_results["t"];
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("second"));
    assert_eq!(result.success_rate, Some(0.0));

    stack
        .recorder
        .wait_for(EventKind::ConstellationFailed, 1, Duration::from_secs(2))
        .await;
    assert_eq!(stack.recorder.count_of(EventKind::TaskStarted), 2);
    assert_eq!(stack.recorder.count_of(EventKind::TaskFailed), 1);
}

#[tokio::test]
async fn conditional_edges_gate_and_strand_the_unchosen_branch() {
    let stack = stack(ScriptedBroker::with_two_windows_devices());
    stack.predicates.register("has_errors", |v: &serde_json::Value| {
        v.get("errors").and_then(serde_json::Value::as_u64).unwrap_or(0) > 0
    });
    stack.predicates.register("no_errors", |v: &serde_json::Value| {
        v.get("errors").and_then(serde_json::Value::as_u64) == Some(0)
    });

    let broker = &stack.broker;
    broker.script("scan", ScriptedOutcome::Succeed(json!({"errors": 0})));

    let mut c = Constellation::new("s4", "conditional");
    for id in ["scan", "cleanup", "deploy"] {
        c.add_task(TaskStar::new(id, id)).unwrap();
    }
    c.add_line(StarLine::conditional("l1", "scan", "cleanup", "errors found", "has_errors"))
        .unwrap();
    c.add_line(StarLine::conditional("l2", "scan", "deploy", "no errors", "no_errors"))
        .unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let result = stack
        .orchestrator
        .execute(constellation.clone(), ExecuteOptions::default())
        .await
        .unwrap();

    // The unchosen branch never ran; the run still completes, surfacing
    // the stranded task as skipped.
    assert_eq!(result.status, ConstellationState::Completed);
    assert_eq!(result.task_results["scan"].status, TaskStatus::Completed);
    assert_eq!(result.task_results["deploy"].status, TaskStatus::Completed);
    assert_eq!(result.task_results["cleanup"].status, TaskStatus::Pending);
    assert_eq!(result.metadata.get("skipped_tasks"), Some(&json!(["cleanup"])));

    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    let started = stack.recorder.task_ids_of(EventKind::TaskStarted);
    assert!(started.contains(&"scan".to_owned()));
    assert!(started.contains(&"deploy".to_owned()));
    assert!(!started.contains(&"cleanup".to_owned()));
}

#[tokio::test]
async fn cancellation_mid_flight_cancels_everything() {
    let broker = ScriptedBroker::with_two_windows_devices();
    broker.script("a", ScriptedOutcome::Hang);
    broker.script("b", ScriptedOutcome::Hang);
    let stack = stack(broker);

    let mut c = Constellation::new("s5", "cancel");
    c.add_task(TaskStar::new("a", "a")).unwrap();
    c.add_task(TaskStar::new("b", "b")).unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let orchestrator = stack.orchestrator.clone();
    let run = tokio::spawn({
        let constellation = constellation.clone();
        async move {
            orchestrator
                .execute(constellation, ExecuteOptions::default())
                .await
        }
    });

    stack
        .recorder
        .wait_for(EventKind::TaskStarted, 2, Duration::from_secs(2))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(stack.orchestrator.cancel("s5").await);
    let result = run.await.unwrap().unwrap();

    assert_eq!(result.status, ConstellationState::Cancelled);
    assert_eq!(result.task_results["a"].status, TaskStatus::Cancelled);
    assert_eq!(result.task_results["b"].status, TaskStatus::Cancelled);

    stack
        .recorder
        .wait_for(EventKind::ConstellationCancelled, 1, Duration::from_secs(2))
        .await;
    // No further starts after the two initial ones.
    assert_eq!(stack.recorder.count_of(EventKind::TaskStarted), 2);
    assert_eq!(stack.recorder.count_of(EventKind::TaskCancelled), 2);

    // Transport-level cancellation reached the broker for the in-flight
    // tasks.
    let mut cancelled = stack.broker.cancelled();
    cancelled.sort();
    cancelled.dedup();
    assert_eq!(cancelled, vec!["a".to_owned(), "b".to_owned()]);

    // Cancelling again (or an unknown id) is a safe no-op.
    assert!(!stack.orchestrator.cancel("s5").await);
    assert!(!stack.orchestrator.cancel("never-existed").await);
}

#[tokio::test]
async fn task_timeout_is_failure_with_timeout_reason() {
    let broker = ScriptedBroker::with_two_windows_devices();
    broker.script("t", ScriptedOutcome::Hang);
    let stack = stack(broker);

    let mut c = Constellation::new("timeout", "timeout");
    c.add_task(TaskStar::new("t", "t").with_timeout(0.2)).unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let result = stack
        .orchestrator
        .execute(constellation, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Failed);
    let record = &result.task_results["t"];
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn empty_constellation_completes_immediately() {
    let stack = stack(ScriptedBroker::with_two_windows_devices());
    let constellation = Arc::new(Mutex::new(Constellation::new("empty", "empty")));

    let result = stack
        .orchestrator
        .execute(constellation, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Completed);
    assert!(result.task_results.is_empty());
    assert_eq!(result.success_rate, None);

    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    assert_eq!(
        stack.recorder.kinds(),
        vec![
            EventKind::ConstellationStarted,
            EventKind::ConstellationCompleted,
        ]
    );
}

#[tokio::test]
async fn no_connected_devices_fails_fast() {
    let stack = stack(ScriptedBroker::new(vec![]));
    let constellation = Arc::new(Mutex::new(chain(
        "nodev",
        &["a", "b"],
        DependencyKind::SuccessOnly,
    )));

    let result = stack
        .orchestrator
        .execute(constellation, ExecuteOptions::default())
        .await;
    assert!(matches!(result, Err(OrchestratorError::Assignment(_))));

    // No lifecycle events beyond the failure: the run never started.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stack.recorder.count_of(EventKind::TaskStarted), 0);
}

#[tokio::test]
async fn higher_priority_ready_tasks_start_first() {
    use astral_graph::TaskPriority;

    let broker = ScriptedBroker::with_two_windows_devices();
    let stack = stack(broker);

    let mut c = Constellation::new("prio", "priority");
    c.add_task(TaskStar::new("low", "low").with_priority(TaskPriority::Low))
        .unwrap();
    c.add_task(TaskStar::new("critical", "critical").with_priority(TaskPriority::Critical))
        .unwrap();
    let constellation = Arc::new(Mutex::new(c));

    let result = stack
        .orchestrator
        .execute(
            constellation,
            ExecuteOptions {
                strategy: AssignStrategy::RoundRobin,
                preferences: HashMap::new(),
                // Serialize execution so start order is observable.
                max_parallel: Some(1),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, ConstellationState::Completed);
    stack
        .recorder
        .wait_for(EventKind::ConstellationCompleted, 1, Duration::from_secs(2))
        .await;
    assert_eq!(
        stack.recorder.task_ids_of(EventKind::TaskStarted),
        vec!["critical".to_owned(), "low".to_owned()]
    );
}

#[tokio::test]
async fn fresh_stack_starts_idle() {
    let stack = stack(ScriptedBroker::with_two_windows_devices());
    assert_eq!(stack.bus.subscriber_count(), 1);
    assert_eq!(stack.synchronizer.pending_count(), 0);
    assert!(!stack.synchronizer.expects_modifications());
    assert!(stack.predicates.names().is_empty());
}
