// src/dag/scheduler_step.rs

//! Step-by-step result type for the run scheduler.

use crate::dag::task_info::ScheduledTask;
use crate::types::NodeId;

/// Structured result of a single scheduler "step".
///
/// The engine uses it to know what to dispatch and which task records to
/// publish; tests use it to assert exactly what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Tasks that became QUEUED in this step and must be dispatched.
    pub newly_queued: Vec<ScheduledTask>,
    /// Nodes that were SKIPPED in this step (including cascades).
    pub newly_skipped: Vec<NodeId>,
    /// Every node whose state changed in this step, in change order.
    pub changed: Vec<NodeId>,
    /// Whether this step moved the run into a terminal state.
    pub run_just_finished: bool,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && !self.run_just_finished
    }

    pub fn merge(&mut self, other: SchedulerStep) {
        self.newly_queued.extend(other.newly_queued);
        self.newly_skipped.extend(other.newly_skipped);
        self.changed.extend(other.changed);
        self.run_just_finished |= other.run_just_finished;
    }
}
