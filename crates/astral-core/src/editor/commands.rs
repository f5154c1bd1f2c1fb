//! Standard editor commands.
//!
//! Each command parses its parameter record at build time (validation
//! first), then mutates the constellation in `apply`. Rollback is handled
//! by the editor via snapshots, so commands are free to mutate eagerly.

use serde_json::{Value, json};

use astral_graph::serialize::{
    self, ConstellationDoc, LineDoc, TaskDoc, line_from_doc, task_from_doc,
};
use astral_graph::{Constellation, DependencyKind, DeviceType, IdAllocator, TaskPriority};

use super::EditorError;

/// A single reversible mutation. Applied under the editor's constellation
/// lock; the editor snapshots before `apply` and restores on failure.
pub trait EditCommand: Send {
    fn name(&self) -> &'static str;

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError>;
}

fn invalid(command: &str, message: impl Into<String>) -> EditorError {
    EditorError::InvalidParams {
        command: command.to_owned(),
        message: message.into(),
    }
}

fn parse_doc<T: serde::de::DeserializeOwned>(
    command: &str,
    params: Value,
) -> Result<T, EditorError> {
    serde_json::from_value(params).map_err(|e| invalid(command, e.to_string()))
}

fn require_str(params: &Value, key: &str, command: &str) -> Result<String, EditorError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| invalid(command, format!("missing required field {key:?}")))
}

// ---------------------------------------------------------------------------
// add_task / remove_task / update_task
// ---------------------------------------------------------------------------

pub struct AddTask {
    doc: TaskDoc,
}

impl AddTask {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            doc: parse_doc("add_task", params)?,
        }))
    }
}

impl EditCommand for AddTask {
    fn name(&self) -> &'static str {
        "add_task"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let task = task_from_doc(self.doc.clone(), constellation.constellation_id(), ids);
        let task_id = task.task_id().to_owned();
        constellation.add_task(task)?;
        Ok(json!({ "task_id": task_id }))
    }
}

pub struct RemoveTask {
    task_id: String,
}

impl RemoveTask {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            task_id: require_str(&params, "task_id", "remove_task")?,
        }))
    }
}

impl EditCommand for RemoveTask {
    fn name(&self) -> &'static str {
        "remove_task"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        constellation.remove_task(&self.task_id)?;
        Ok(json!({ "task_id": self.task_id, "removed": true }))
    }
}

pub struct UpdateTask {
    task_id: String,
    fields: serde_json::Map<String, Value>,
}

impl UpdateTask {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        let task_id = require_str(&params, "task_id", "update_task")?;
        let Value::Object(fields) = params else {
            return Err(invalid("update_task", "parameters must be an object"));
        };
        Ok(Box::new(Self { task_id, fields }))
    }
}

impl EditCommand for UpdateTask {
    fn name(&self) -> &'static str {
        "update_task"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let task = constellation
            .task_mut(&self.task_id)
            .ok_or_else(|| astral_graph::GraphError::TaskNotFound(self.task_id.clone()))?;

        let mut updated: Vec<String> = Vec::new();
        for (key, value) in &self.fields {
            match key.as_str() {
                "task_id" | "on_task_id" => continue,
                "name" => {
                    let name = value
                        .as_str()
                        .ok_or_else(|| invalid("update_task", "name must be a string"))?;
                    task.set_name(name)?;
                }
                "description" => {
                    let description = value
                        .as_str()
                        .ok_or_else(|| invalid("update_task", "description must be a string"))?;
                    task.set_description(description)?;
                }
                "tips" => {
                    let tips: Option<Vec<String>> = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("tips: {e}")))?;
                    task.set_tips(tips)?;
                }
                "priority" => {
                    let priority: TaskPriority = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("priority: {e}")))?;
                    task.set_priority(priority)?;
                }
                "device_type" => {
                    let device_type: Option<DeviceType> = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("device_type: {e}")))?;
                    task.set_device_type(device_type)?;
                }
                "target_device_id" => {
                    let device_id: Option<String> = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("target_device_id: {e}")))?;
                    task.set_target_device_id(device_id)?;
                }
                "timeout" => {
                    let timeout: Option<f64> = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("timeout: {e}")))?;
                    task.set_timeout(timeout)?;
                }
                "retry_count" => {
                    let retries: u32 = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("retry_count: {e}")))?;
                    task.set_retry_budget(retries)?;
                }
                "expected_output_type" => {
                    let tag: Option<String> = serde_json::from_value(value.clone())
                        .map_err(|e| invalid("update_task", format!("expected_output_type: {e}")))?;
                    task.set_expected_output_type(tag)?;
                }
                "task_data" => {
                    let data: serde_json::Map<String, Value> =
                        serde_json::from_value(value.clone())
                            .map_err(|e| invalid("update_task", format!("task_data: {e}")))?;
                    task.update_task_data(data)?;
                }
                unknown => {
                    return Err(invalid(
                        "update_task",
                        format!("unknown field {unknown:?}"),
                    ));
                }
            }
            updated.push(key.clone());
        }

        Ok(json!({ "task_id": self.task_id, "updated": updated }))
    }
}

// ---------------------------------------------------------------------------
// add_dependency / remove_dependency / update_dependency
// ---------------------------------------------------------------------------

pub struct AddDependency {
    doc: LineDoc,
}

impl AddDependency {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            doc: parse_doc("add_dependency", params)?,
        }))
    }
}

impl EditCommand for AddDependency {
    fn name(&self) -> &'static str {
        "add_dependency"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let line = line_from_doc(self.doc.clone(), constellation.constellation_id(), ids);
        let line_id = line.line_id().to_owned();
        constellation.add_line(line)?;
        Ok(json!({ "line_id": line_id }))
    }
}

pub struct RemoveDependency {
    line_id: String,
}

impl RemoveDependency {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            line_id: require_str(&params, "line_id", "remove_dependency")?,
        }))
    }
}

impl EditCommand for RemoveDependency {
    fn name(&self) -> &'static str {
        "remove_dependency"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let existed = constellation.line(&self.line_id).is_some();
        constellation.remove_line(&self.line_id);
        Ok(json!({ "line_id": self.line_id, "removed": existed }))
    }
}

pub struct UpdateDependency {
    line_id: String,
    fields: serde_json::Map<String, Value>,
}

impl UpdateDependency {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        let line_id = require_str(&params, "line_id", "update_dependency")?;
        let Value::Object(fields) = params else {
            return Err(invalid("update_dependency", "parameters must be an object"));
        };
        Ok(Box::new(Self { line_id, fields }))
    }
}

impl EditCommand for UpdateDependency {
    fn name(&self) -> &'static str {
        "update_dependency"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let mut updated: Vec<String> = Vec::new();
        {
            let line = constellation
                .line_mut(&self.line_id)
                .ok_or_else(|| astral_graph::GraphError::LineNotFound(self.line_id.clone()))?;

            for (key, value) in &self.fields {
                match key.as_str() {
                    "line_id" | "on_task_id" => continue,
                    "dependency_type" => {
                        let kind: DependencyKind = serde_json::from_value(value.clone())
                            .map_err(|e| {
                                invalid("update_dependency", format!("dependency_type: {e}"))
                            })?;
                        line.set_kind(kind);
                    }
                    "condition_description" => {
                        let description = value.as_str().ok_or_else(|| {
                            invalid("update_dependency", "condition_description must be a string")
                        })?;
                        line.set_condition_description(description);
                    }
                    "predicate" => {
                        let predicate: Option<String> = serde_json::from_value(value.clone())
                            .map_err(|e| {
                                invalid("update_dependency", format!("predicate: {e}"))
                            })?;
                        line.set_predicate(predicate);
                    }
                    "is_satisfied" => {
                        let satisfied = value.as_bool().ok_or_else(|| {
                            invalid("update_dependency", "is_satisfied must be a boolean")
                        })?;
                        if satisfied {
                            line.mark_satisfied();
                        } else {
                            line.reset_satisfaction();
                        }
                    }
                    "metadata" => {
                        let metadata: serde_json::Map<String, Value> =
                            serde_json::from_value(value.clone()).map_err(|e| {
                                invalid("update_dependency", format!("metadata: {e}"))
                            })?;
                        line.update_metadata(metadata);
                    }
                    unknown => {
                        return Err(invalid(
                            "update_dependency",
                            format!("unknown field {unknown:?}"),
                        ));
                    }
                }
                updated.push(key.clone());
            }
        }

        // Satisfaction may have changed; re-derive the dependency sets.
        constellation.rebuild_references();
        Ok(json!({ "line_id": self.line_id, "updated": updated }))
    }
}

// ---------------------------------------------------------------------------
// clear / bulk_build / merge / subgraph / load
// ---------------------------------------------------------------------------

pub struct Clear;

impl Clear {
    pub fn build(_params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self))
    }
}

impl EditCommand for Clear {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        constellation.clear()?;
        Ok(json!({ "cleared": true }))
    }
}

#[derive(serde::Deserialize)]
struct BulkBuildParams {
    #[serde(default)]
    tasks: Vec<TaskDoc>,
    #[serde(default)]
    dependencies: Vec<LineDoc>,
}

/// Tasks plus dependency lines in one transaction. The editor's snapshot
/// rollback makes partial application invisible on failure.
pub struct BulkBuild {
    params: BulkBuildParams,
}

impl BulkBuild {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            params: parse_doc("bulk_build", params)?,
        }))
    }
}

impl EditCommand for BulkBuild {
    fn name(&self) -> &'static str {
        "bulk_build"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let mut task_ids = Vec::new();
        for doc in self.params.tasks.clone() {
            let task = task_from_doc(doc, constellation.constellation_id(), ids);
            task_ids.push(task.task_id().to_owned());
            constellation.add_task(task)?;
        }
        let mut line_ids = Vec::new();
        for doc in self.params.dependencies.clone() {
            let line = line_from_doc(doc, constellation.constellation_id(), ids);
            line_ids.push(line.line_id().to_owned());
            constellation.add_line(line)?;
        }
        Ok(json!({ "tasks": task_ids, "dependencies": line_ids }))
    }
}

#[derive(serde::Deserialize)]
struct MergeParams {
    constellation: ConstellationDoc,
    #[serde(default = "MergeParams::default_prefix")]
    prefix: String,
}

impl MergeParams {
    fn default_prefix() -> String {
        "merged_".to_owned()
    }
}

pub struct Merge {
    params: MergeParams,
}

impl Merge {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            params: parse_doc("merge", params)?,
        }))
    }
}

impl EditCommand for Merge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let other = serialize::from_doc(self.params.constellation.clone(), ids)?;
        let added = constellation.merge(&other, &self.params.prefix)?;
        Ok(json!({ "added": added }))
    }
}

pub struct Subgraph {
    task_ids: Vec<String>,
}

impl Subgraph {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        let task_ids: Vec<String> = params
            .get("task_ids")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| invalid("subgraph", format!("task_ids: {e}")))?
            .ok_or_else(|| invalid("subgraph", "missing required field \"task_ids\""))?;
        Ok(Box::new(Self { task_ids }))
    }
}

impl EditCommand for Subgraph {
    fn name(&self) -> &'static str {
        "subgraph"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        _ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        // Projection is a derivation: the working constellation is left
        // untouched and the projected document is returned.
        let projection = constellation.subgraph(&self.task_ids)?;
        Ok(serialize::to_value(&projection))
    }
}

#[derive(serde::Deserialize)]
struct LoadParams {
    document: ConstellationDoc,
}

pub struct Load {
    params: LoadParams,
}

impl Load {
    pub fn build(params: Value) -> Result<Box<dyn EditCommand>, EditorError> {
        Ok(Box::new(Self {
            params: parse_doc("load", params)?,
        }))
    }
}

impl EditCommand for Load {
    fn name(&self) -> &'static str {
        "load"
    }

    fn apply(
        &mut self,
        constellation: &mut Constellation,
        ids: &IdAllocator,
    ) -> Result<Value, EditorError> {
        let loaded = serialize::from_doc(self.params.document.clone(), ids)?;
        let summary = json!({
            "constellation_id": loaded.constellation_id(),
            "tasks": loaded.task_count(),
            "dependencies": loaded.line_count(),
        });
        *constellation = loaded;
        Ok(summary)
    }
}
