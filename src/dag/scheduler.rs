// src/dag/scheduler.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::dag::graph::PipelineGraph;
use crate::dag::readiness::{failure_handled, readiness, Readiness};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state::{PipelineState, TaskEvent, TaskState, TaskSummary};
use crate::dag::task_info::{ScheduledTask, TaskRun};
use crate::errors::{PipeflowError, Result};
use crate::types::{CorrelationId, NodeId, RunId, TaskRunId};

/// Per-run DAG state machine.
///
/// Holds the immutable graph of the pipeline plus the mutable task runs of
/// one pipeline run. It is responsible for:
/// - queueing entry nodes on admission
/// - applying task transitions reported by the runner
/// - queueing successors whose incoming edges are all satisfied
/// - skipping (transitively) successors that can no longer be satisfied
/// - deriving the run state after every change
///
/// It performs no IO; the engine owns dispatch and locking.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    run_id: RunId,
    graph: Arc<PipelineGraph>,
    tasks: HashMap<NodeId, TaskRun>,
    by_task_run: HashMap<TaskRunId, NodeId>,
    admitted: bool,
    cancel_requested: bool,
    finished: bool,
}

impl DagScheduler {
    /// A freshly materialized run: every task PENDING, not admitted.
    pub fn new(run_id: RunId, graph: Arc<PipelineGraph>, tasks: Vec<TaskRun>) -> Self {
        Self::restore(run_id, graph, tasks, false, false)
    }

    /// Rebuild a run from persisted task records.
    pub fn restore(
        run_id: RunId,
        graph: Arc<PipelineGraph>,
        tasks: Vec<TaskRun>,
        admitted: bool,
        cancel_requested: bool,
    ) -> Self {
        let by_task_run = tasks.iter().map(|t| (t.id, t.node.clone())).collect();
        let tasks: HashMap<NodeId, TaskRun> =
            tasks.into_iter().map(|t| (t.node.clone(), t)).collect();

        let finished = (admitted || cancel_requested)
            && tasks.values().all(|t| t.state.is_terminal());

        Self {
            run_id,
            graph,
            tasks,
            by_task_run,
            admitted,
            cancel_requested,
            finished,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Whether the run has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Derived run state; recomputed from the task states on every call.
    pub fn state(&self) -> PipelineState {
        let summaries: Vec<TaskSummary> = self
            .tasks()
            .map(|t| TaskSummary {
                state: t.state,
                failure_handled: failure_handled(&self.graph, &t.node, t.state),
            })
            .collect();
        PipelineState::derive(&summaries, self.admitted, self.cancel_requested)
    }

    pub fn task(&self, node: &str) -> Option<&TaskRun> {
        self.tasks.get(node)
    }

    pub fn task_by_id(&self, id: TaskRunId) -> Option<&TaskRun> {
        self.by_task_run.get(&id).and_then(|n| self.tasks.get(n))
    }

    pub fn node_of(&self, id: TaskRunId) -> Option<&str> {
        self.by_task_run.get(&id).map(|n| n.as_str())
    }

    /// Task runs in node declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRun> {
        self.graph.nodes().filter_map(|n| self.tasks.get(n))
    }

    pub fn run_state_of(&self, node: &str) -> Option<TaskState> {
        self.tasks.get(node).map(|t| t.state)
    }

    /// Whether every incoming edge group of `node` is satisfied.
    ///
    /// Returns `None` if the node is unknown.
    pub fn deps_satisfied(&self, node: &str) -> Option<bool> {
        if !self.tasks.contains_key(node) {
            return None;
        }
        Some(readiness(&self.graph, node, |n| self.run_state_of(n)) == Readiness::Ready)
    }

    /// Admit the run: queue every entry node.
    ///
    /// A no-op on a run that is already admitted or already finished.
    pub fn admit(&mut self, now: DateTime<Utc>) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.admitted || self.finished {
            return step;
        }

        self.admitted = true;
        info!(run_id = %self.run_id, "run admitted; queueing entry nodes");

        let graph = Arc::clone(&self.graph);
        for node in graph.entry_nodes() {
            if self.run_state_of(node) == Some(TaskState::Pending) {
                self.enqueue(node, now, &mut step);
            }
        }

        self.maybe_finish(&mut step);
        step
    }

    /// Re-evaluate every PENDING node of an admitted run.
    ///
    /// Used after a restart, when a completion may have been persisted
    /// without the successors it unlocked. Runs to a fixpoint so skips
    /// cascade.
    pub fn resume(&mut self, now: DateTime<Utc>) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if !self.admitted || self.finished {
            return step;
        }

        let graph = Arc::clone(&self.graph);
        loop {
            let mut progressed = false;

            for node in graph.nodes() {
                if self.run_state_of(node) != Some(TaskState::Pending) {
                    continue;
                }
                match readiness(&graph, node, |n| self.run_state_of(n)) {
                    Readiness::Waiting => {}
                    Readiness::Ready => {
                        self.enqueue(node, now, &mut step);
                        progressed = true;
                    }
                    Readiness::Dead => {
                        if self.transition(node, TaskEvent::Skip, now).is_ok() {
                            step.changed.push(node.to_string());
                            step.newly_skipped.push(node.to_string());
                            progressed = true;
                        }
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        self.maybe_finish(&mut step);
        step
    }

    /// Record that the runner accepted `node` under `correlation`.
    pub fn mark_started(
        &mut self,
        node: &str,
        correlation: CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(node, TaskEvent::Start, now)?;
        if let Some(task) = self.tasks.get_mut(node) {
            task.correlation_id = Some(correlation);
        }
        Ok(())
    }

    /// Handle a process exit for `node`.
    pub fn complete(
        &mut self,
        node: &str,
        exit_code: i32,
        now: DateTime<Utc>,
    ) -> Result<SchedulerStep> {
        self.finish_task(node, TaskEvent::Complete { exit_code }, now)
    }

    /// Handle an infrastructure fault for `node` (no exit code).
    pub fn fail(&mut self, node: &str, reason: &str, now: DateTime<Utc>) -> Result<SchedulerStep> {
        self.finish_task(
            node,
            TaskEvent::Fail {
                reason: reason.to_string(),
            },
            now,
        )
    }

    /// Cancel every non-terminal task and mark the run as cancelled.
    ///
    /// `changed` lists the tasks that were cancelled by this call.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.finished {
            return step;
        }

        self.cancel_requested = true;

        let live: Vec<NodeId> = self
            .tasks()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.node.clone())
            .collect();

        for node in live {
            if self.transition(&node, TaskEvent::Cancel, now).is_ok() {
                step.changed.push(node);
            }
        }

        self.maybe_finish(&mut step);
        step
    }

    fn finish_task(
        &mut self,
        node: &str,
        event: TaskEvent,
        now: DateTime<Utc>,
    ) -> Result<SchedulerStep> {
        let state = self.transition(node, event, now)?;

        let mut step = SchedulerStep::default();
        step.changed.push(node.to_string());
        debug!(run_id = %self.run_id, task = %node, %state, "task reached terminal state");

        self.propagate(node, now, &mut step);
        self.maybe_finish(&mut step);
        Ok(step)
    }

    /// Re-evaluate the successors of a node that just became terminal.
    ///
    /// Skips cascade: a skipped node is itself terminal, so its successors
    /// are pushed back onto the worklist.
    fn propagate(&mut self, from: &str, now: DateTime<Utc>, step: &mut SchedulerStep) {
        let graph = Arc::clone(&self.graph);
        let mut worklist: Vec<NodeId> = vec![from.to_string()];

        while let Some(done) = worklist.pop() {
            for succ in graph.successors(&done) {
                if self.run_state_of(succ) != Some(TaskState::Pending) {
                    continue;
                }

                match readiness(&graph, succ, |n| self.run_state_of(n)) {
                    Readiness::Waiting => {}
                    Readiness::Ready => self.enqueue(succ, now, step),
                    Readiness::Dead => {
                        if self.transition(succ, TaskEvent::Skip, now).is_ok() {
                            debug!(
                                run_id = %self.run_id,
                                task = %succ,
                                upstream = %done,
                                "no satisfiable incoming edge; skipping"
                            );
                            step.changed.push(succ.to_string());
                            step.newly_skipped.push(succ.to_string());
                            worklist.push(succ.to_string());
                        }
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, node: &str, now: DateTime<Utc>, step: &mut SchedulerStep) {
        if self.transition(node, TaskEvent::Enqueue, now).is_err() {
            return;
        }
        if let Some(task) = self.tasks.get(node) {
            debug!(run_id = %self.run_id, task = %node, "dependencies satisfied; queued");
            step.changed.push(node.to_string());
            step.newly_queued.push(ScheduledTask::from_task_run(task));
        }
    }

    fn maybe_finish(&mut self, step: &mut SchedulerStep) {
        if self.finished {
            return;
        }
        if !self.admitted && !self.cancel_requested {
            return;
        }
        if self.tasks.values().any(|t| !t.state.is_terminal()) {
            return;
        }

        self.finished = true;
        step.run_just_finished = true;
        info!(run_id = %self.run_id, state = %self.state(), "all tasks terminal; run finished");
    }

    fn transition(&mut self, node: &str, event: TaskEvent, now: DateTime<Utc>) -> Result<TaskState> {
        let task = self
            .tasks
            .get_mut(node)
            .ok_or_else(|| {
                PipeflowError::Validation(format!("run {} has no node '{}'", self.run_id, node))
            })?;

        let next = task.state.apply(&event).map_err(|e| e.for_task(node))?;
        task.state = next;

        match next {
            TaskState::Queued => task.queued_at = Some(now),
            TaskState::Running => task.started_at = Some(now),
            s if s.is_terminal() => task.completed_at = Some(now),
            _ => {}
        }

        Ok(next)
    }
}
