//! The device collaborator contract -- the narrow seam to the transport
//! layer that actually drives worker devices.
//!
//! The core never talks to devices directly; it goes through a
//! [`DeviceBroker`] implementation supplied by the embedder. The trait is
//! object-safe so brokers can be stored as `Arc<dyn DeviceBroker>`.

pub mod assign;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use astral_graph::DeviceType;

pub use assign::{AssignError, AssignStrategy};

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device {0:?} is not connected")]
    NotConnected(String),

    #[error("transport failure: {0}")]
    Failure(String),
}

/// A connected worker device as reported by the broker.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: Option<DeviceType>,
    pub capabilities: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, device_type: Option<DeviceType>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            capabilities: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// A task dispatch request handed to the broker.
#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub task_id: String,
    pub device_id: String,
    /// Human-readable request text (description + tips).
    pub description: String,
    /// Free-form payload forwarded to the device.
    pub payload: serde_json::Map<String, Value>,
    pub timeout: Duration,
}

/// The outcome a device reports for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ExecutionOutcome {
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            result: Some(result),
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            start_time: None,
            end_time: None,
        }
    }
}

/// Adapter interface to the device transport.
///
/// # Object safety
///
/// The trait is object-safe: the orchestrator stores it as
/// `Arc<dyn DeviceBroker>`.
#[async_trait]
pub trait DeviceBroker: Send + Sync {
    /// Devices currently connected and able to accept work.
    async fn list_connected(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Details for a single device, `None` when unknown.
    async fn device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>, TransportError>;

    /// Dispatch a task to a device and wait for its outcome.
    async fn assign_task(&self, request: AssignRequest) -> Result<ExecutionOutcome, TransportError>;

    /// Abort an in-flight task at the transport level.
    async fn cancel_task(&self, task_id: &str) -> Result<(), TransportError>;
}

// Compile-time assertion: DeviceBroker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn DeviceBroker) {}
};
