//! Individual task representation ("star") within a constellation.
//!
//! A star owns its descriptive, routing and scheduling attributes plus its
//! execution state. The denormalized dependency/dependent sets are cached
//! views of the line set, maintained by the owning [`crate::Constellation`]
//! and never by callers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::GraphError;
use crate::models::{DeviceType, TaskPriority, TaskStatus};

/// Outcome of a single task execution attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The attempt produced a result value.
    Success(Value),
    /// The attempt failed with an error description.
    Failure(String),
}

impl AttemptOutcome {
    /// The JSON payload dependency predicates are evaluated against:
    /// the result on success, the error string on failure.
    pub fn payload(&self) -> Value {
        match self {
            Self::Success(v) => v.clone(),
            Self::Failure(e) => Value::String(e.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A single task in a constellation.
#[derive(Debug, Clone)]
pub struct TaskStar {
    pub(crate) task_id: String,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) tips: Option<Vec<String>>,
    pub(crate) target_device_id: Option<String>,
    pub(crate) device_type: Option<DeviceType>,
    pub(crate) priority: TaskPriority,
    pub(crate) timeout: Option<f64>,
    pub(crate) retry_budget: u32,
    pub(crate) current_retry: u32,
    pub(crate) task_data: serde_json::Map<String, Value>,
    pub(crate) expected_output_type: Option<String>,
    pub(crate) status: TaskStatus,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
    pub(crate) execution_start_time: Option<DateTime<Utc>>,
    pub(crate) execution_end_time: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    /// Prerequisite task ids whose incoming lines are not yet satisfied.
    pub(crate) dependencies: BTreeSet<String>,
    /// Task ids for which this task is a prerequisite.
    pub(crate) dependents: BTreeSet<String>,
    /// Insertion order within the owning constellation. Not serialized;
    /// used for deterministic tie-breaking.
    pub(crate) ordinal: u64,
}

impl TaskStar {
    /// Create a new pending task.
    pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            name: name.into(),
            description: String::new(),
            tips: None,
            target_device_id: None,
            device_type: None,
            priority: TaskPriority::Medium,
            timeout: None,
            retry_budget: 0,
            current_retry: 0,
            task_data: serde_json::Map::new(),
            expected_output_type: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            execution_start_time: None,
            execution_end_time: None,
            created_at: now,
            updated_at: now,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            ordinal: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tips(mut self, tips: Vec<String>) -> Self {
        self.tips = Some(tips);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn with_target_device(mut self, device_id: impl Into<String>) -> Self {
        self.target_device_id = Some(device_id.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn with_task_data(mut self, data: serde_json::Map<String, Value>) -> Self {
        self.task_data = data;
        self
    }

    pub fn with_expected_output_type(mut self, tag: impl Into<String>) -> Self {
        self.expected_output_type = Some(tag.into());
        self
    }

    // -- accessors ---------------------------------------------------------

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tips(&self) -> Option<&[String]> {
        self.tips.as_deref()
    }

    pub fn target_device_id(&self) -> Option<&str> {
        self.target_device_id.as_deref()
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn timeout(&self) -> Option<f64> {
        self.timeout
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn current_retry(&self) -> u32 {
        self.current_retry
    }

    pub fn task_data(&self) -> &serde_json::Map<String, Value> {
        &self.task_data
    }

    pub fn expected_output_type(&self) -> Option<&str> {
        self.expected_output_type.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Status with the waiting-dependency alias applied: a pending task
    /// with unresolved prerequisites reports `WaitingDependency`.
    pub fn display_status(&self) -> TaskStatus {
        if self.status == TaskStatus::Pending && !self.dependencies.is_empty() {
            TaskStatus::WaitingDependency
        } else {
            self.status
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.execution_start_time
    }

    pub fn execution_end_time(&self) -> Option<DateTime<Utc>> {
        self.execution_end_time
    }

    /// Duration of the final attempt in seconds, when both stamps exist.
    pub fn execution_duration(&self) -> Option<f64> {
        match (self.execution_start_time, self.execution_end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending with no unresolved prerequisites. The owning constellation
    /// additionally checks incoming-line satisfaction before scheduling.
    pub fn is_ready_to_execute(&self) -> bool {
        self.status == TaskStatus::Pending && self.dependencies.is_empty()
    }

    /// Pending tasks (including the waiting-dependency alias) may be edited.
    pub fn is_modifiable(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// The description + tips block sent to a device as the task request.
    pub fn request_string(&self) -> String {
        let tips = match &self.tips {
            Some(tips) if !tips.is_empty() => tips
                .iter()
                .map(|t| format!(" - {t}"))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "No tips available.".to_string(),
        };
        format!(
            "Task Description: {}\nTips for Completion:\n{}",
            self.description, tips
        )
    }

    // -- guarded mutation --------------------------------------------------

    fn refuse_if_running(&self) -> Result<(), GraphError> {
        if self.status == TaskStatus::Running {
            return Err(GraphError::TaskRunning(self.task_id.clone()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.name = name.into();
        self.touch();
        Ok(())
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.description = description.into();
        self.touch();
        Ok(())
    }

    pub fn set_tips(&mut self, tips: Option<Vec<String>>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.tips = tips;
        self.touch();
        Ok(())
    }

    pub fn set_target_device_id(&mut self, device_id: Option<String>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.target_device_id = device_id;
        self.touch();
        Ok(())
    }

    pub fn set_device_type(&mut self, device_type: Option<DeviceType>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.device_type = device_type;
        self.touch();
        Ok(())
    }

    pub fn set_priority(&mut self, priority: TaskPriority) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.priority = priority;
        self.touch();
        Ok(())
    }

    pub fn set_timeout(&mut self, seconds: Option<f64>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.timeout = seconds;
        self.touch();
        Ok(())
    }

    pub fn set_retry_budget(&mut self, retries: u32) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.retry_budget = retries;
        self.touch();
        Ok(())
    }

    pub fn set_expected_output_type(&mut self, tag: Option<String>) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        self.expected_output_type = tag;
        self.touch();
        Ok(())
    }

    /// Merge entries into the task payload.
    pub fn update_task_data(
        &mut self,
        data: serde_json::Map<String, Value>,
    ) -> Result<(), GraphError> {
        self.refuse_if_running()?;
        for (k, v) in data {
            self.task_data.insert(k, v);
        }
        self.touch();
        Ok(())
    }

    // -- state machine -----------------------------------------------------

    /// `Pending` -> `Running`, stamping the attempt start time.
    pub fn start_execution(&mut self) -> Result<(), GraphError> {
        if self.status != TaskStatus::Pending {
            return Err(GraphError::InvalidTransition {
                task: self.task_id.clone(),
                from: self.status,
                to: TaskStatus::Running,
            });
        }
        if !self.dependencies.is_empty() {
            return Err(GraphError::DependenciesUnsatisfied(self.task_id.clone()));
        }
        self.status = TaskStatus::Running;
        let now = Utc::now();
        self.execution_start_time = Some(now);
        self.execution_end_time = None;
        self.updated_at = now;
        Ok(())
    }

    /// `Running` -> `Completed`, recording the result.
    pub fn complete_with_success(&mut self, result: Value) -> Result<(), GraphError> {
        if self.status != TaskStatus::Running {
            return Err(GraphError::InvalidTransition {
                task: self.task_id.clone(),
                from: self.status,
                to: TaskStatus::Completed,
            });
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        let now = Utc::now();
        self.execution_end_time = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `Running` -> `Failed`, recording the error.
    pub fn complete_with_failure(&mut self, error: impl Into<String>) -> Result<(), GraphError> {
        if self.status != TaskStatus::Running {
            return Err(GraphError::InvalidTransition {
                task: self.task_id.clone(),
                from: self.status,
                to: TaskStatus::Failed,
            });
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        let now = Utc::now();
        self.execution_end_time = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal status -> `Cancelled`. Terminal tasks are left
    /// untouched and `false` is returned.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.status == TaskStatus::Running {
            self.execution_end_time = Some(Utc::now());
        }
        self.status = TaskStatus::Cancelled;
        self.touch();
        true
    }

    /// Whether a failed task still has retry budget left.
    pub fn should_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.current_retry < self.retry_budget
    }

    /// Reset a failed task for another attempt. Each attempt stamps its own
    /// start/end times, so both are cleared here.
    pub fn retry(&mut self) -> Result<(), GraphError> {
        if self.status != TaskStatus::Failed {
            return Err(GraphError::InvalidTransition {
                task: self.task_id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        if self.current_retry >= self.retry_budget {
            return Err(GraphError::RetryExhausted {
                task: self.task_id.clone(),
                current: self.current_retry,
                budget: self.retry_budget,
            });
        }
        self.current_retry += 1;
        self.status = TaskStatus::Pending;
        self.error = None;
        self.execution_start_time = None;
        self.execution_end_time = None;
        self.touch();
        Ok(())
    }
}
