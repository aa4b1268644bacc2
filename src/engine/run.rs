// src/engine/run.rs

//! Public record of a pipeline run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::PipelineState;
use crate::types::{RunId, TaskRunId, TriggerKind};

/// Snapshot of one pipeline run.
///
/// `state` is derived from the task states at the time the snapshot was
/// taken; `queue_position` is owned by the category queue (0 while active,
/// 1..N while waiting, `None` once terminal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub category: String,
    pub trigger: TriggerKind,
    /// Run-level parameter overrides.
    pub parameters: BTreeMap<String, String>,
    pub state: PipelineState,
    pub queue_position: Option<usize>,
    /// Task runs in node declaration order.
    pub task_runs: Vec<TaskRunId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
