// src/types.rs

//! Identifiers and small shared enums used across the engine.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::TaskState;

/// Boxed future returned by the collaborator traits (`RunnerBackend`,
/// `RunStore`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Node identifier inside a pipeline definition (unique within a run).
pub type NodeId = String;

/// Identifier of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a single task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRunId(Uuid);

impl TaskRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque id handed out by the runner for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh random correlation id, for runners that have no native handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a pipeline run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    #[default]
    Manual,
    Scheduled,
    Recurring,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Recurring => "recurring",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(TriggerKind::Manual),
            "scheduled" => Ok(TriggerKind::Scheduled),
            "recurring" => Ok(TriggerKind::Recurring),
            other => Err(format!(
                "invalid trigger kind: {other} (expected \"manual\", \"scheduled\" or \"recurring\")"
            )),
        }
    }
}

/// Terminal state a source node must reach for an edge to fire.
///
/// - `Success`: the source exited with code 0.
/// - `Failure`: the source failed, either with a nonzero exit code or an
///   infrastructure error.
/// - `Error`: the source hit an infrastructure error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeCondition {
    #[default]
    Success,
    Failure,
    Error,
}

impl EdgeCondition {
    /// Whether a source that ended in `state` satisfies this condition.
    pub fn matches(self, state: TaskState) -> bool {
        match self {
            EdgeCondition::Success => state == TaskState::Success,
            EdgeCondition::Failure => matches!(state, TaskState::Failure | TaskState::Error),
            EdgeCondition::Error => state == TaskState::Error,
        }
    }
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeCondition::Success => "success",
            EdgeCondition::Failure => "failure",
            EdgeCondition::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for EdgeCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" => Ok(EdgeCondition::Success),
            "failure" => Ok(EdgeCondition::Failure),
            "error" => Ok(EdgeCondition::Error),
            other => Err(format!(
                "invalid edge condition: {other} (expected \"success\", \"failure\" or \"error\")"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_edges_fire_on_errored_sources() {
        assert!(EdgeCondition::Failure.matches(TaskState::Failure));
        assert!(EdgeCondition::Failure.matches(TaskState::Error));
        assert!(!EdgeCondition::Error.matches(TaskState::Failure));
        assert!(!EdgeCondition::Success.matches(TaskState::Skipped));
        assert!(!EdgeCondition::Failure.matches(TaskState::Cancelled));
    }

    #[test]
    fn parses_trigger_kind_case_insensitively() {
        assert_eq!("Recurring".parse::<TriggerKind>(), Ok(TriggerKind::Recurring));
        assert!("hourly".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn unset_trigger_and_edge_condition_default() {
        assert_eq!(TriggerKind::default(), TriggerKind::Manual);
        assert_eq!(EdgeCondition::default(), EdgeCondition::Success);
    }
}
