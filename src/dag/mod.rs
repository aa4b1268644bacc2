// src/dag/mod.rs

//! DAG representation and per-run scheduling.
//!
//! - [`graph`] validates a pipeline definition into an acyclic graph.
//! - [`state`] holds the task and run state machines.
//! - [`readiness`] evaluates incoming edges of a node.
//! - [`scheduler`] contains the per-run state machine that decides
//!   which tasks are queued or skipped after every transition.
//! - [`task_info`] provides task-run records and dispatch descriptions.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod readiness;
pub mod scheduler;
pub mod scheduler_step;
pub mod state;
pub mod task_info;

pub use graph::{Edge, PipelineGraph};
pub use readiness::Readiness;
pub use scheduler::DagScheduler;
pub use scheduler_step::SchedulerStep;
pub use state::{PipelineState, TaskEvent, TaskState, TaskSummary, TransitionError};
pub use task_info::{ScheduledTask, TaskRun};
