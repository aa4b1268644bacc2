// src/dag/task_info.rs

//! Task-run records and the dispatch description handed to the runner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::state::TaskState;
use crate::types::{CorrelationId, NodeId, RunId, TaskRunId};

/// One materialized node of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub run_id: RunId,
    /// Node id, unique within the run.
    pub node: NodeId,
    /// Id of the task definition this run was materialized from.
    pub definition: String,
    pub command: String,
    pub state: TaskState,
    /// Effective parameters: template < run < position.
    pub parameters: BTreeMap<String, String>,
    /// Correlation id of the current dispatch, once the runner accepted it.
    pub correlation_id: Option<CorrelationId>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(
        run_id: RunId,
        node: NodeId,
        definition: String,
        command: String,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: TaskRunId::new(),
            run_id,
            node,
            definition,
            command,
            state: TaskState::Pending,
            parameters,
            correlation_id: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Description of a task that the engine wants the runner to execute now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub run_id: RunId,
    pub task_run_id: TaskRunId,
    pub node: NodeId,
    pub command: String,
    pub parameters: BTreeMap<String, String>,
}

impl ScheduledTask {
    pub fn from_task_run(task: &TaskRun) -> Self {
        Self {
            run_id: task.run_id,
            task_run_id: task.id,
            node: task.node.clone(),
            command: task.command.clone(),
            parameters: task.parameters.clone(),
        }
    }
}
