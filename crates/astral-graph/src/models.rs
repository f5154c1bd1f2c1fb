//! Core enums shared across the constellation graph.
//!
//! All enums serialize to their canonical uppercase wire form and parse
//! case-insensitively. [`TaskPriority`] additionally accepts its integer
//! form (1..=4) on the wire.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task within a constellation.
///
/// `WaitingDependency` is a wire-level alias for `Pending` with a non-empty
/// dependency set; it is normalised to `Pending` on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    WaitingDependency,
}

impl TaskStatus {
    /// Whether this status is terminal (the task will not run again).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Collapse the `WaitingDependency` alias to its canonical form.
    pub fn canonical(self) -> Self {
        match self {
            Self::WaitingDependency => Self::Pending,
            other => other,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::WaitingDependency => "WAITING_DEPENDENCY",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "WAITING_DEPENDENCY" => Ok(Self::WaitingDependency),
            _ => Err(TaskStatusParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------

/// State of an entire constellation, derived from its task statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConstellationState {
    #[default]
    Created,
    Ready,
    Executing,
    Completed,
    Failed,
    PartiallyFailed,
    Cancelled,
}

impl fmt::Display for ConstellationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Ready => "READY",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::PartiallyFailed => "PARTIALLY_FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for ConstellationState {
    type Err = ConstellationStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "READY" => Ok(Self::Ready),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "PARTIALLY_FAILED" => Ok(Self::PartiallyFailed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(ConstellationStateParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ConstellationState`] string.
#[derive(Debug, Clone)]
pub struct ConstellationStateParseError(pub String);

impl fmt::Display for ConstellationStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid constellation state: {:?}", self.0)
    }
}

impl std::error::Error for ConstellationStateParseError {}

impl Serialize for ConstellationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConstellationState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------

/// Priority of a task. Higher values schedule first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    /// Numeric wire value (1..=4).
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = TaskPriorityParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(TaskPriorityParseError(other.to_string())),
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" | "1" => Ok(Self::Low),
            "MEDIUM" | "2" => Ok(Self::Medium),
            "HIGH" | "3" => Ok(Self::High),
            "CRITICAL" | "4" => Ok(Self::Critical),
            _ => Err(TaskPriorityParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] value.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

impl Serialize for TaskPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PriorityVisitor;

        impl Visitor<'_> for PriorityVisitor {
            type Value = TaskPriority;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a priority name or an integer in 1..=4")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u8::try_from(v)
                    .ok()
                    .and_then(|n| TaskPriority::try_from(n).ok())
                    .ok_or_else(|| E::custom(TaskPriorityParseError(v.to_string())))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(TaskPriorityParseError(v.to_string())))
                    .and_then(|n| self.visit_u64(n))
            }
        }

        deserializer.deserialize_any(PriorityVisitor)
    }
}

// ---------------------------------------------------------------------------

/// Kind of device a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Windows,
    Macos,
    Linux,
    Android,
    Ios,
    Web,
    Api,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Windows => "WINDOWS",
            Self::Macos => "MACOS",
            Self::Linux => "LINUX",
            Self::Android => "ANDROID",
            Self::Ios => "IOS",
            Self::Web => "WEB",
            Self::Api => "API",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceType {
    type Err = DeviceTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WINDOWS" => Ok(Self::Windows),
            "MACOS" => Ok(Self::Macos),
            "LINUX" => Ok(Self::Linux),
            "ANDROID" => Ok(Self::Android),
            "IOS" => Ok(Self::Ios),
            "WEB" => Ok(Self::Web),
            "API" => Ok(Self::Api),
            _ => Err(DeviceTypeParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DeviceType`] string.
#[derive(Debug, Clone)]
pub struct DeviceTypeParseError(pub String);

impl fmt::Display for DeviceTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device type: {:?}", self.0)
    }
}

impl std::error::Error for DeviceTypeParseError {}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------

/// How a dependency line between two tasks is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DependencyKind {
    /// Satisfied once the prerequisite is terminal, regardless of outcome.
    #[default]
    Unconditional,
    /// Satisfied only when the prerequisite completed successfully.
    SuccessOnly,
    /// Satisfied once the prerequisite is terminal (success or failure).
    CompletionOnly,
    /// Satisfied when the named predicate accepts the prerequisite's
    /// result (or error). Degrades to `SuccessOnly` without a predicate.
    Conditional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconditional => "UNCONDITIONAL",
            Self::SuccessOnly => "SUCCESS_ONLY",
            Self::CompletionOnly => "COMPLETION_ONLY",
            Self::Conditional => "CONDITIONAL",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyKind {
    type Err = DependencyKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNCONDITIONAL" => Ok(Self::Unconditional),
            "SUCCESS_ONLY" => Ok(Self::SuccessOnly),
            "COMPLETION_ONLY" => Ok(Self::CompletionOnly),
            "CONDITIONAL" => Ok(Self::Conditional),
            _ => Err(DependencyKindParseError(s.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DependencyKind`] string.
#[derive(Debug, Clone)]
pub struct DependencyKindParseError(pub String);

impl fmt::Display for DependencyKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency kind: {:?}", self.0)
    }
}

impl std::error::Error for DependencyKindParseError {}

impl Serialize for DependencyKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DependencyKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
