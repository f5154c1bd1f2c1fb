//! Device assignment strategies.
//!
//! The assignment pass runs before the scheduling loop and writes each
//! task's `target_device_id`. Preferences (`task_id -> device_id`) win
//! whenever the preferred device is currently connected.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use astral_graph::{Constellation, TaskStatus};

use super::{DeviceBroker, DeviceInfo, TransportError};

/// Caller-selectable assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignStrategy {
    /// Walk connected devices cyclically.
    #[default]
    RoundRobin,
    /// First device whose type matches the task's `device_type`; any
    /// device when nothing matches or the task has no type.
    CapabilityMatch,
    /// Device with the fewest tasks assigned within this constellation.
    LoadBalance,
}

impl fmt::Display for AssignStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::CapabilityMatch => "capability_match",
            Self::LoadBalance => "load_balance",
        };
        f.write_str(s)
    }
}

impl FromStr for AssignStrategy {
    type Err = AssignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "capability_match" => Ok(Self::CapabilityMatch),
            "load_balance" => Ok(Self::LoadBalance),
            other => Err(AssignError::UnknownStrategy(other.to_owned())),
        }
    }
}

/// Errors from the assignment pass.
#[derive(Debug, Error)]
pub enum AssignError {
    #[error("no connected devices available for assignment")]
    NoDevices,

    #[error("unknown assignment strategy: {0:?}")]
    UnknownStrategy(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Assign a device to every modifiable task in the constellation and
/// return the resulting `task_id -> device_id` map.
pub async fn assign_devices(
    constellation: &mut Constellation,
    broker: &dyn DeviceBroker,
    strategy: AssignStrategy,
    preferences: &HashMap<String, String>,
) -> Result<HashMap<String, String>, AssignError> {
    let devices = broker.list_connected().await?;
    if devices.is_empty() {
        return Err(AssignError::NoDevices);
    }

    tracing::info!(
        constellation_id = %constellation.constellation_id(),
        strategy = %strategy,
        devices = devices.len(),
        "assigning devices"
    );

    let assignments = match strategy {
        AssignStrategy::RoundRobin => round_robin(constellation, &devices, preferences),
        AssignStrategy::CapabilityMatch => capability_match(constellation, &devices, preferences),
        AssignStrategy::LoadBalance => load_balance(constellation, &devices, preferences),
    };

    for (task_id, device_id) in &assignments {
        if let Some(task) = constellation.task_mut(task_id) {
            if let Err(error) = task.set_target_device_id(Some(device_id.clone())) {
                tracing::warn!(task_id = %task_id, error = %error, "skipping assignment");
            }
        }
    }

    Ok(assignments)
}

fn preferred<'a>(
    task_id: &str,
    devices: &'a [DeviceInfo],
    preferences: &HashMap<String, String>,
) -> Option<&'a str> {
    let wanted = preferences.get(task_id)?;
    devices
        .iter()
        .find(|d| &d.device_id == wanted)
        .map(|d| d.device_id.as_str())
}

fn assignable_ids(constellation: &Constellation) -> Vec<String> {
    constellation
        .tasks_in_order()
        .into_iter()
        .filter(|t| t.status() != TaskStatus::Running)
        .map(|t| t.task_id().to_owned())
        .collect()
}

fn round_robin(
    constellation: &Constellation,
    devices: &[DeviceInfo],
    preferences: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut assignments = HashMap::new();
    let mut cursor = 0usize;
    for task_id in assignable_ids(constellation) {
        if let Some(device_id) = preferred(&task_id, devices, preferences) {
            assignments.insert(task_id, device_id.to_owned());
            continue;
        }
        let device = &devices[cursor % devices.len()];
        assignments.insert(task_id, device.device_id.clone());
        cursor += 1;
    }
    assignments
}

fn capability_match(
    constellation: &Constellation,
    devices: &[DeviceInfo],
    preferences: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut assignments = HashMap::new();
    for task_id in assignable_ids(constellation) {
        if let Some(device_id) = preferred(&task_id, devices, preferences) {
            assignments.insert(task_id, device_id.to_owned());
            continue;
        }
        let wanted_type = constellation
            .task(&task_id)
            .and_then(|t| t.device_type());
        let device = wanted_type
            .and_then(|wanted| devices.iter().find(|d| d.device_type == Some(wanted)))
            .unwrap_or(&devices[0]);
        assignments.insert(task_id, device.device_id.clone());
    }
    assignments
}

fn load_balance(
    constellation: &Constellation,
    devices: &[DeviceInfo],
    preferences: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut load: HashMap<&str, usize> = devices
        .iter()
        .map(|d| (d.device_id.as_str(), 0usize))
        .collect();
    let mut assignments = HashMap::new();

    for task_id in assignable_ids(constellation) {
        if let Some(device_id) = preferred(&task_id, devices, preferences) {
            *load.get_mut(device_id).expect("preferred device is listed") += 1;
            assignments.insert(task_id, device_id.to_owned());
            continue;
        }
        // Devices iterated in listing order, so ties go to the first.
        let least = devices
            .iter()
            .map(|d| d.device_id.as_str())
            .min_by_key(|id| load[id])
            .expect("devices is non-empty");
        *load.get_mut(least).expect("device is listed") += 1;
        assignments.insert(task_id, least.to_owned());
    }
    assignments
}

/// Tasks-per-device counts for a constellation's current assignments.
pub fn device_utilization(constellation: &Constellation) -> HashMap<String, usize> {
    let mut utilization: HashMap<String, usize> = HashMap::new();
    for task in constellation.tasks_in_order() {
        if let Some(device_id) = task.target_device_id() {
            *utilization.entry(device_id.to_owned()).or_default() += 1;
        }
    }
    utilization
}

/// Ids of tasks still lacking a device assignment.
pub fn unassigned_tasks(constellation: &Constellation) -> Vec<String> {
    constellation
        .tasks_in_order()
        .into_iter()
        .filter(|t| t.target_device_id().is_none())
        .map(|t| t.task_id().to_owned())
        .collect()
}
