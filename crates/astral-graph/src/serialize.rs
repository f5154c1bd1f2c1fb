//! Canonical JSON document format for constellations.
//!
//! The wire structs mirror the document layout; conversion functions map
//! them onto the in-memory model and back. Parsing is lenient where the
//! format allows it:
//! - `tasks` and `dependencies` accept both the keyed-object form and the
//!   list form; the loader converts lists to the keyed map, minting ids
//!   when absent.
//! - Enum fields parse case-insensitively; priority also accepts 1..=4.
//! - Unknown constellation-level fields are preserved into `metadata`.
//! - Denormalized `dependencies`/`dependents` on task records are ignored
//!   on input and rebuilt from the line table.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::constellation::Constellation;
use crate::error::GraphError;
use crate::ids::IdAllocator;
use crate::line::StarLine;
use crate::models::{ConstellationState, DependencyKind, DeviceType, TaskPriority, TaskStatus};
use crate::star::TaskStar;

/// Errors that can occur while reading or writing constellation documents.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

/// Task record as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDoc {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tips: Option<Vec<String>>,
    #[serde(default)]
    pub target_device_id: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub current_retry: u32,
    #[serde(default)]
    pub task_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub expected_output_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_end_time: Option<DateTime<Utc>>,
    /// Derived on output; ignored on input.
    #[serde(default)]
    pub execution_duration: Option<f64>,
    /// Denormalized view; ignored on input and rebuilt from lines.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Denormalized view; ignored on input and rebuilt from lines.
    #[serde(default)]
    pub dependents: Vec<String>,
}

/// Dependency line record as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDoc {
    #[serde(default)]
    pub line_id: Option<String>,
    pub from_task_id: String,
    pub to_task_id: String,
    #[serde(default)]
    pub dependency_type: DependencyKind,
    #[serde(default)]
    pub condition_description: String,
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub is_satisfied: bool,
    #[serde(default)]
    pub last_evaluation_result: Option<bool>,
    #[serde(default)]
    pub last_evaluation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Constellation document as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstellationDoc {
    #[serde(default)]
    pub constellation_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: ConstellationState,
    #[serde(
        default,
        deserialize_with = "de_task_table",
        serialize_with = "ser_task_table"
    )]
    pub tasks: Vec<TaskDoc>,
    #[serde(
        default,
        deserialize_with = "de_line_table",
        serialize_with = "ser_line_table"
    )]
    pub dependencies: Vec<LineDoc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_duration: Option<f64>,
    /// Unknown top-level fields, preserved into `metadata` on load.
    /// Always empty when produced by [`to_doc`], so nothing extra is
    /// written back out.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Accept `tasks` as either `{id: task}` or `[task, ...]`.
fn de_task_table<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<TaskDoc>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, task_value)| {
                let mut doc: TaskDoc =
                    serde_json::from_value(task_value).map_err(D::Error::custom)?;
                if doc.task_id.is_none() {
                    doc.task_id = Some(key);
                }
                Ok(doc)
            })
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(D::Error::custom))
            .collect(),
        _ => Err(D::Error::custom("tasks must be an object or a list")),
    }
}

fn ser_task_table<S: Serializer>(tasks: &[TaskDoc], serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(tasks.len()))?;
    for task in tasks {
        let key = task.task_id.as_deref().unwrap_or_default();
        map.serialize_entry(key, task)?;
    }
    map.end()
}

/// Accept `dependencies` as either `{id: line}` or `[line, ...]`.
fn de_line_table<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<LineDoc>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, line_value)| {
                let mut doc: LineDoc =
                    serde_json::from_value(line_value).map_err(D::Error::custom)?;
                if doc.line_id.is_none() {
                    doc.line_id = Some(key);
                }
                Ok(doc)
            })
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(D::Error::custom))
            .collect(),
        _ => Err(D::Error::custom("dependencies must be an object or a list")),
    }
}

fn ser_line_table<S: Serializer>(lines: &[LineDoc], serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(lines.len()))?;
    for line in lines {
        let key = line.line_id.as_deref().unwrap_or_default();
        map.serialize_entry(key, line)?;
    }
    map.end()
}

// ---------------------------------------------------------------------------
// Model -> document
// ---------------------------------------------------------------------------

fn task_to_doc(task: &TaskStar) -> TaskDoc {
    TaskDoc {
        task_id: Some(task.task_id.clone()),
        name: task.name.clone(),
        description: task.description.clone(),
        tips: task.tips.clone(),
        target_device_id: task.target_device_id.clone(),
        device_type: task.device_type,
        priority: task.priority,
        status: task.display_status(),
        result: task.result.clone(),
        error: task.error.clone(),
        timeout: task.timeout,
        retry_count: task.retry_budget,
        current_retry: task.current_retry,
        task_data: task.task_data.clone(),
        expected_output_type: task.expected_output_type.clone(),
        created_at: Some(task.created_at),
        updated_at: Some(task.updated_at),
        execution_start_time: task.execution_start_time,
        execution_end_time: task.execution_end_time,
        execution_duration: task.execution_duration(),
        dependencies: task.dependencies.iter().cloned().collect(),
        dependents: task.dependents.iter().cloned().collect(),
    }
}

fn line_to_doc(line: &StarLine) -> LineDoc {
    LineDoc {
        line_id: Some(line.line_id.clone()),
        from_task_id: line.from_task_id.clone(),
        to_task_id: line.to_task_id.clone(),
        dependency_type: line.kind,
        condition_description: line.condition_description.clone(),
        predicate: line.predicate.clone(),
        metadata: line.metadata.clone(),
        is_satisfied: line.is_satisfied,
        last_evaluation_result: line.last_evaluation_result,
        last_evaluation_time: line.last_evaluation_time,
        created_at: Some(line.created_at),
        updated_at: Some(line.updated_at),
    }
}

/// Build the wire document for a constellation.
pub fn to_doc(constellation: &Constellation) -> ConstellationDoc {
    ConstellationDoc {
        constellation_id: Some(constellation.constellation_id.clone()),
        name: Some(constellation.name.clone()),
        state: constellation.state,
        tasks: constellation
            .tasks_in_order()
            .into_iter()
            .map(task_to_doc)
            .collect(),
        dependencies: constellation
            .lines_in_order()
            .into_iter()
            .map(line_to_doc)
            .collect(),
        metadata: constellation.metadata.clone(),
        created_at: Some(constellation.created_at),
        updated_at: Some(constellation.updated_at),
        execution_start_time: constellation.execution_start_time,
        execution_end_time: constellation.execution_end_time,
        execution_duration: constellation.execution_duration(),
        extra: serde_json::Map::new(),
    }
}

/// Serialize a constellation to a JSON value.
pub fn to_value(constellation: &Constellation) -> Value {
    serde_json::to_value(to_doc(constellation)).expect("document serialization is infallible")
}

/// Serialize a constellation to a pretty-printed JSON string.
pub fn to_json(constellation: &Constellation) -> String {
    serde_json::to_string_pretty(&to_doc(constellation))
        .expect("document serialization is infallible")
}

/// Serialize a constellation to a JSON file.
pub fn save_to_file(constellation: &Constellation, path: &Path) -> Result<(), DocumentError> {
    std::fs::write(path, to_json(constellation)).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Document -> model
// ---------------------------------------------------------------------------

/// Build a [`TaskStar`] from a wire record, minting an id when absent.
pub fn task_from_doc(
    doc: TaskDoc,
    constellation_id: &str,
    ids: &IdAllocator,
) -> TaskStar {
    let task_id = match doc.task_id {
        Some(id) => {
            // Best-effort registration so future minting avoids this id.
            let _ = ids.register_task_id(constellation_id, &id);
            id
        }
        None => ids.next_task_id(constellation_id),
    };

    let now = Utc::now();
    let name = if doc.name.is_empty() {
        task_id.clone()
    } else {
        doc.name
    };

    let mut task = TaskStar::new(task_id, name);
    task.description = doc.description;
    task.tips = doc.tips;
    task.target_device_id = doc.target_device_id;
    task.device_type = doc.device_type;
    task.priority = doc.priority;
    task.timeout = doc.timeout;
    task.retry_budget = doc.retry_count;
    task.current_retry = doc.current_retry;
    task.task_data = doc.task_data;
    task.expected_output_type = doc.expected_output_type;
    // The waiting-dependency alias is display-only.
    task.status = doc.status.canonical();
    task.result = doc.result;
    task.error = doc.error;
    task.created_at = doc.created_at.unwrap_or(now);
    task.updated_at = doc.updated_at.unwrap_or(now);
    task.execution_start_time = doc.execution_start_time;
    task.execution_end_time = doc.execution_end_time;
    task
}

/// Build a [`StarLine`] from a wire record, minting an id when absent.
pub fn line_from_doc(doc: LineDoc, constellation_id: &str, ids: &IdAllocator) -> StarLine {
    let line_id = match doc.line_id {
        Some(id) => {
            let _ = ids.register_line_id(constellation_id, &id);
            id
        }
        None => ids.next_line_id(constellation_id),
    };

    let now = Utc::now();
    let mut line = StarLine::new(line_id, doc.from_task_id, doc.to_task_id)
        .with_kind(doc.dependency_type)
        .with_condition(doc.condition_description)
        .with_metadata(doc.metadata);
    line.predicate = doc.predicate;
    line.is_satisfied = doc.is_satisfied;
    line.last_evaluation_result = doc.last_evaluation_result;
    line.last_evaluation_time = doc.last_evaluation_time;
    line.created_at = doc.created_at.unwrap_or(now);
    line.updated_at = doc.updated_at.unwrap_or(now);
    line
}

/// Reconstruct a constellation from a parsed wire document.
pub fn from_doc(doc: ConstellationDoc, ids: &IdAllocator) -> Result<Constellation, DocumentError> {
    let constellation_id = doc
        .constellation_id
        .unwrap_or_else(|| ids.new_constellation_id());
    let name = doc.name.unwrap_or_else(|| constellation_id.clone());

    let mut constellation = Constellation::new(constellation_id.clone(), name);
    constellation.metadata = doc.metadata;
    for (key, value) in doc.extra {
        tracing::warn!(field = %key, "unknown document field preserved into metadata");
        constellation.metadata.insert(key, value);
    }

    for task_doc in doc.tasks {
        let task = task_from_doc(task_doc, &constellation_id, ids);
        constellation.add_task(task)?;
    }
    for line_doc in doc.dependencies {
        let line = line_from_doc(line_doc, &constellation_id, ids);
        constellation.add_line(line)?;
    }

    // Input denormalized sets are ignored; rebuild from the line table.
    constellation.rebuild_references();

    constellation.state = doc.state;
    let now = Utc::now();
    constellation.created_at = doc.created_at.unwrap_or(now);
    constellation.updated_at = doc.updated_at.unwrap_or(now);
    constellation.execution_start_time = doc.execution_start_time;
    constellation.execution_end_time = doc.execution_end_time;

    Ok(constellation)
}

/// Reconstruct a constellation from a JSON value.
pub fn from_value(value: Value, ids: &IdAllocator) -> Result<Constellation, DocumentError> {
    if !value.is_object() {
        return Err(DocumentError::NotAnObject);
    }
    let doc: ConstellationDoc = serde_json::from_value(value)?;
    from_doc(doc, ids)
}

/// Reconstruct a constellation from a JSON string.
pub fn from_json(json: &str, ids: &IdAllocator) -> Result<Constellation, DocumentError> {
    let value: Value = serde_json::from_str(json)?;
    from_value(value, ids)
}

/// Reconstruct a constellation from a JSON file.
pub fn load_from_file(path: &Path, ids: &IdAllocator) -> Result<Constellation, DocumentError> {
    let json = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_json(&json, ids)
}
