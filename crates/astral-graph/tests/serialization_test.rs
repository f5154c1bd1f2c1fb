//! Document round-trip and lenient-parsing tests for the constellation
//! JSON format.

use serde_json::{Value, json};

use astral_graph::serialize;
use astral_graph::{
    AttemptOutcome, Constellation, ConstellationState, DependencyKind, DeviceType, IdAllocator,
    PredicateRegistry, StarLine, TaskPriority, TaskStar, TaskStatus,
};

fn sample_constellation() -> Constellation {
    let mut c = Constellation::new("c_demo", "demo");
    c.add_task(
        TaskStar::new("a", "scan")
            .with_description("Scan the project")
            .with_priority(TaskPriority::High)
            .with_device_type(DeviceType::Windows)
            .with_timeout(30.0)
            .with_retry_budget(2),
    )
    .unwrap();
    c.add_task(
        TaskStar::new("b", "report")
            .with_description("Write the report")
            .with_tips(vec!["Keep it short".into()]),
    )
    .unwrap();
    c.add_line(
        StarLine::success_only("l1", "a", "b").with_condition("scan finished cleanly"),
    )
    .unwrap();
    c
}

#[test]
fn roundtrip_preserves_structure_and_attributes() {
    let ids = IdAllocator::new();
    let original = sample_constellation();

    let json = serialize::to_json(&original);
    let loaded = serialize::from_json(&json, &ids).expect("roundtrip should parse");

    assert_eq!(loaded.constellation_id(), original.constellation_id());
    assert_eq!(loaded.name(), original.name());
    assert_eq!(loaded.state(), original.state());
    assert_eq!(loaded.task_count(), 2);
    assert_eq!(loaded.line_count(), 1);

    let a = loaded.task("a").unwrap();
    assert_eq!(a.name(), "scan");
    assert_eq!(a.priority(), TaskPriority::High);
    assert_eq!(a.device_type(), Some(DeviceType::Windows));
    assert_eq!(a.timeout(), Some(30.0));
    assert_eq!(a.retry_budget(), 2);
    assert_eq!(a.created_at(), original.task("a").unwrap().created_at());

    let line = loaded.line("l1").unwrap();
    assert_eq!(line.kind(), DependencyKind::SuccessOnly);
    assert_eq!(line.condition_description(), "scan finished cleanly");

    // Denormalized sets were rebuilt, not trusted from input.
    assert!(loaded.task("b").unwrap().dependencies().contains("a"));
    assert!(loaded.task("a").unwrap().dependents().contains("b"));
}

#[test]
fn roundtrip_preserves_execution_state() {
    let ids = IdAllocator::new();
    let registry = PredicateRegistry::new();
    let mut original = sample_constellation();
    original.start_execution();
    original.start_task("a").unwrap();
    original
        .complete_task("a", AttemptOutcome::Success(json!({"errors": 0})), &registry)
        .unwrap();

    let loaded = serialize::from_json(&serialize::to_json(&original), &ids).unwrap();

    let a = loaded.task("a").unwrap();
    assert_eq!(a.status(), TaskStatus::Completed);
    assert_eq!(a.result(), Some(&json!({"errors": 0})));
    assert!(a.execution_start_time().is_some());
    assert!(a.execution_end_time().is_some());

    // The satisfied line leaves b with an empty dependency set.
    assert!(loaded.line("l1").unwrap().is_satisfied());
    assert!(loaded.task("b").unwrap().dependencies().is_empty());
    assert_eq!(loaded.state(), ConstellationState::Executing);
}

#[test]
fn list_forms_are_converted_to_keyed_maps() {
    let ids = IdAllocator::new();
    let document = json!({
        "constellation_id": "c_list",
        "name": "list form",
        "tasks": [
            {"task_id": "a", "name": "first"},
            {"task_id": "b", "name": "second"}
        ],
        "dependencies": [
            {"from_task_id": "a", "to_task_id": "b"}
        ]
    });

    let loaded = serialize::from_value(document, &ids).unwrap();
    assert_eq!(loaded.task_count(), 2);
    assert_eq!(loaded.line_count(), 1);
    // The line id was minted.
    assert!(loaded.line("line_001").is_some());
    assert!(loaded.task("b").unwrap().dependencies().contains("a"));

    // Output is the keyed-object form.
    let out = serialize::to_value(&loaded);
    assert!(out["tasks"].is_object());
    assert!(out["dependencies"].is_object());
    assert!(out["tasks"]["a"].is_object());
}

#[test]
fn enums_parse_case_insensitively_and_from_integers() {
    let ids = IdAllocator::new();
    let document = json!({
        "constellation_id": "c_enum",
        "name": "enums",
        "state": "ready",
        "tasks": {
            "a": {
                "task_id": "a",
                "priority": 1,
                "status": "waiting_dependency",
                "device_type": "macos"
            }
        },
        "dependencies": {}
    });

    let loaded = serialize::from_value(document, &ids).unwrap();
    assert_eq!(loaded.state(), ConstellationState::Ready);
    let a = loaded.task("a").unwrap();
    assert_eq!(a.priority(), TaskPriority::Low);
    assert_eq!(a.device_type(), Some(DeviceType::Macos));
    // Waiting-dependency is an alias for pending.
    assert_eq!(a.status(), TaskStatus::Pending);
}

#[test]
fn unknown_fields_are_preserved_into_metadata() {
    let ids = IdAllocator::new();
    let document = json!({
        "constellation_id": "c_extra",
        "name": "extra",
        "tasks": {},
        "dependencies": {},
        "planner_round": 7,
        "origin": "planner-v2"
    });

    let loaded = serialize::from_value(document, &ids).unwrap();
    assert_eq!(loaded.metadata().get("planner_round"), Some(&json!(7)));
    assert_eq!(
        loaded.metadata().get("origin"),
        Some(&json!("planner-v2"))
    );
}

#[test]
fn malformed_documents_are_rejected() {
    let ids = IdAllocator::new();
    assert!(serialize::from_json("not json", &ids).is_err());
    assert!(serialize::from_value(json!([1, 2, 3]), &ids).is_err());
    // A dangling line endpoint is a graph error.
    let document = json!({
        "constellation_id": "c_bad",
        "name": "bad",
        "tasks": {"a": {"task_id": "a"}},
        "dependencies": {"l1": {"from_task_id": "a", "to_task_id": "ghost"}}
    });
    assert!(serialize::from_value(document, &ids).is_err());
}

#[test]
fn file_save_and_load() {
    let ids = IdAllocator::new();
    let original = sample_constellation();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("constellation.json");

    serialize::save_to_file(&original, &path).expect("save should succeed");
    let loaded = serialize::load_from_file(&path, &ids).expect("load should succeed");

    assert_eq!(loaded.constellation_id(), original.constellation_id());
    assert_eq!(loaded.task_count(), original.task_count());

    let missing = dir.path().join("missing.json");
    let err = serialize::load_from_file(&missing, &ids).unwrap_err();
    assert!(matches!(err, serialize::DocumentError::Io { .. }));
}

#[test]
fn serialized_task_reports_waiting_dependency_alias() {
    let c = sample_constellation();
    let value = serialize::to_value(&c);
    // Task b has an unresolved dependency on a, so its wire status is the
    // waiting-dependency alias.
    assert_eq!(value["tasks"]["b"]["status"], Value::from("WAITING_DEPENDENCY"));
    assert_eq!(value["tasks"]["a"]["status"], Value::from("PENDING"));
    assert_eq!(value["tasks"]["b"]["dependencies"], json!(["a"]));
}
