// src/dag/state.rs

//! Task and pipeline-run state machine.
//!
//! Task transitions are driven only by explicit [`TaskEvent`]s. Pipeline-run
//! state is never stored on its own; it is derived from the current task
//! states with [`PipelineState::derive`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::PipeflowError;

/// Lifecycle state of a single task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Materialized, waiting for its incoming edges.
    Pending,
    /// Eligible; about to be handed to the runner.
    Queued,
    /// Accepted by the runner.
    Running,
    Success,
    Failure,
    Error,
    Cancelled,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success
                | TaskState::Failure
                | TaskState::Error
                | TaskState::Cancelled
                | TaskState::Skipped
        )
    }

    /// FAILURE or ERROR.
    pub fn is_failed(self) -> bool {
        matches!(self, TaskState::Failure | TaskState::Error)
    }

    /// Apply `event`, returning the next state.
    ///
    /// Terminal states accept nothing: any event on them is reported as
    /// [`TransitionError::AlreadyTerminal`].
    pub fn apply(self, event: &TaskEvent) -> Result<TaskState, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                state: self,
                event: event.name(),
            });
        }

        let next = match (self, event) {
            (TaskState::Pending, TaskEvent::Enqueue) => TaskState::Queued,
            (TaskState::Queued, TaskEvent::Start) => TaskState::Running,
            (TaskState::Running, TaskEvent::Complete { exit_code: 0 }) => TaskState::Success,
            (TaskState::Running, TaskEvent::Complete { .. }) => TaskState::Failure,
            (_, TaskEvent::Fail { .. }) => TaskState::Error,
            (_, TaskEvent::Cancel) => TaskState::Cancelled,
            (TaskState::Pending, TaskEvent::Skip) => TaskState::Skipped,
            (state, event) => {
                return Err(TransitionError::NotAllowed {
                    state,
                    event: event.name(),
                });
            }
        };

        Ok(next)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Events that move a task through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Enqueue,
    Start,
    /// Process exited; 0 means SUCCESS, anything else FAILURE.
    Complete { exit_code: i32 },
    /// Infrastructure fault before or without an exit code.
    Fail { reason: String },
    Cancel,
    /// No incoming edge can be satisfied any more.
    Skip,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Enqueue => "enqueue",
            TaskEvent::Start => "start",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Fail { .. } => "fail",
            TaskEvent::Cancel => "cancel",
            TaskEvent::Skip => "skip",
        }
    }
}

/// A rejected task transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task is already {state}; '{event}' not applied")]
    AlreadyTerminal { state: TaskState, event: &'static str },

    #[error("'{event}' is not valid from {state}")]
    NotAllowed { state: TaskState, event: &'static str },
}

impl TransitionError {
    /// Attach the task name and lift into the crate error.
    pub fn for_task(self, task: &str) -> PipeflowError {
        match self {
            TransitionError::AlreadyTerminal { state, event } => {
                PipeflowError::DuplicateTransition {
                    task: task.to_string(),
                    state,
                    event: event.to_string(),
                }
            }
            TransitionError::NotAllowed { state, event } => PipeflowError::InvalidTransition {
                task: task.to_string(),
                state,
                event: event.to_string(),
            },
        }
    }
}

/// Derived state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    /// Created, waiting for its category slot.
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Success | PipelineState::Failure | PipelineState::Cancelled
        )
    }

    /// Derive the run state from its task summaries.
    ///
    /// - not admitted and not cancelled: PENDING
    /// - any task still PENDING/QUEUED/RUNNING: RUNNING
    /// - cancelled run, or every task CANCELLED: CANCELLED
    /// - any unhandled FAILURE/ERROR, or any CANCELLED task: FAILURE
    /// - otherwise: SUCCESS
    ///
    /// A failed task is *handled* when each of its dependents is reached by
    /// an edge conditioned on that failure (see
    /// [`failure_handled`](crate::dag::readiness::failure_handled)).
    pub fn derive(tasks: &[TaskSummary], admitted: bool, cancel_requested: bool) -> PipelineState {
        if !admitted && !cancel_requested {
            return PipelineState::Pending;
        }

        if tasks.iter().any(|t| !t.state.is_terminal()) {
            return PipelineState::Running;
        }

        let all_cancelled =
            !tasks.is_empty() && tasks.iter().all(|t| t.state == TaskState::Cancelled);
        if cancel_requested || all_cancelled {
            return PipelineState::Cancelled;
        }

        let failed = tasks.iter().any(|t| {
            (t.state.is_failed() && !t.failure_handled) || t.state == TaskState::Cancelled
        });

        if failed {
            PipelineState::Failure
        } else {
            PipelineState::Success
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Pending => "PENDING",
            PipelineState::Running => "RUNNING",
            PipelineState::Success => "SUCCESS",
            PipelineState::Failure => "FAILURE",
            PipelineState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Input to [`PipelineState::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
    pub state: TaskState,
    pub failure_handled: bool,
}
