// src/engine/core.rs

//! The async engine: owns every pipeline run and coordinates the pure
//! schedulers with the runner, the log hub and the store.
//!
//! Locking:
//! - one `tokio::sync::Mutex` per category queue, one per run;
//! - lock order is always category -> run; a run guard is never held while
//!   acquiring a category lock;
//! - the run lock is held across `RunnerBackend::dispatch`, so a completion
//!   for a task can never be applied before its correlation id is recorded.
//!
//! Different categories never share a lock, so they proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::dag::{DagScheduler, PipelineGraph, SchedulerStep, TaskRun, TaskState};
use crate::engine::materializer::{MaterializedRun, Materializer};
use crate::engine::queue::{Admission, CategoryQueue};
use crate::engine::run::PipelineRun;
use crate::engine::{RunEvent, RunnerOutcome};
use crate::errors::{PipeflowError, Result};
use crate::exec::RunnerBackend;
use crate::logs::{LogEntry, LogHub, LogLevel, LogSubscription, SequencedEntry};
use crate::store::{Persister, RunRecord, StoreSnapshot};
use crate::template::{PipelineDefinition, TemplateStore};
use crate::types::{CorrelationId, NodeId, RunId, TaskRunId, TriggerKind};

/// Mutable state of one pipeline run, guarded by its run lock.
#[derive(Debug)]
struct RunSlot {
    definition: PipelineDefinition,
    category: String,
    trigger: TriggerKind,
    parameters: BTreeMap<String, String>,
    /// Written only while the category lock is held.
    queue_position: Option<usize>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    scheduler: DagScheduler,
}

impl RunSlot {
    fn from_materialized(run: MaterializedRun) -> Self {
        let scheduler = DagScheduler::new(run.run_id, run.graph, run.tasks);
        Self {
            definition: run.definition,
            category: run.category,
            trigger: run.trigger,
            parameters: run.parameters,
            queue_position: None,
            created_at: run.created_at,
            started_at: None,
            completed_at: None,
            scheduler,
        }
    }

    fn snapshot(&self) -> PipelineRun {
        PipelineRun {
            id: self.scheduler.run_id(),
            pipeline: self.definition.id.clone(),
            category: self.category.clone(),
            trigger: self.trigger,
            parameters: self.parameters.clone(),
            state: self.scheduler.state(),
            queue_position: self.queue_position,
            task_runs: self.scheduler.tasks().map(|t| t.id).collect(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    fn record(&self) -> RunRecord {
        RunRecord {
            run: self.snapshot(),
            definition: self.definition.clone(),
            cancel_requested: self.scheduler.is_cancel_requested(),
        }
    }
}

#[derive(Debug, Clone)]
struct RunHandle {
    category: String,
    slot: Arc<Mutex<RunSlot>>,
}

struct Inner {
    templates: Arc<dyn TemplateStore>,
    runner: Arc<dyn RunnerBackend>,
    settings: EngineSettings,
    logs: Arc<LogHub>,
    persister: Persister,
    events: broadcast::Sender<RunEvent>,
    runs: RwLock<HashMap<RunId, RunHandle>>,
    task_index: RwLock<HashMap<TaskRunId, RunId>>,
    categories: Mutex<HashMap<String, Arc<Mutex<CategoryQueue>>>>,
}

/// What [`Engine::recover`] rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs restored into memory, terminal ones included.
    pub runs: usize,
    /// Previously running runs that resumed execution.
    pub resumed: usize,
    /// Pending runs put back in their category queue.
    pub requeued: usize,
    /// Previously running runs cancelled because an older one held the slot.
    pub superseded: usize,
    /// QUEUED/RUNNING tasks failed as lost.
    pub lost_tasks: usize,
}

/// Handle to the orchestration engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.inner.settings)
            .field("persisting", &self.inner.persister.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        runner: Arc<dyn RunnerBackend>,
        settings: EngineSettings,
        persister: Persister,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                templates,
                runner,
                logs: Arc::new(LogHub::new(settings.subscriber_buffer)),
                settings,
                persister,
                events,
                runs: RwLock::new(HashMap::new()),
                task_index: RwLock::new(HashMap::new()),
                categories: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.inner.logs
    }

    /// Subscribe to run and task notifications.
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Trigger surface
    // ---------------------------------------------------------------------

    /// Materialize a run and hand it to its category queue.
    ///
    /// Validation errors are returned synchronously and nothing is created.
    /// Everything after that (dispatch failures included) surfaces through
    /// run and task state.
    pub async fn create_run(
        &self,
        pipeline_id: &str,
        trigger: TriggerKind,
        overrides: BTreeMap<String, String>,
    ) -> Result<RunId> {
        let materialized = Materializer::new(self.inner.templates.as_ref())
            .materialize(pipeline_id, trigger, overrides)?;

        let run_id = materialized.run_id;
        let category = materialized.category.clone();
        let created_at = materialized.created_at;

        {
            let mut index = self.inner.task_index.write().await;
            for task in &materialized.tasks {
                self.inner.logs.register(task.id);
                self.inner.persister.task(task.clone());
                index.insert(task.id, run_id);
            }
        }

        let slot = RunSlot::from_materialized(materialized);
        self.inner.persister.run(slot.record());
        self.inner.runs.write().await.insert(
            run_id,
            RunHandle {
                category: category.clone(),
                slot: Arc::new(Mutex::new(slot)),
            },
        );

        info!(run_id = %run_id, pipeline = %pipeline_id, %category, %trigger, "pipeline run created");

        let queue = self.category_queue(&category).await;
        let mut queue = queue.lock().await;

        let position = match queue.admit(run_id, created_at) {
            Admission::Active => 0,
            Admission::Queued(pos) => pos,
        };
        self.emit(RunEvent::RunQueued {
            run_id,
            category,
            position,
        });

        self.settle(&mut queue).await;
        Ok(run_id)
    }

    /// Cancel a run, queued or active.
    ///
    /// Returns `Ok(false)` if the run was already terminal.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<bool> {
        let handle = self.handle(run_id).await?;
        let queue = self.category_queue(&handle.category).await;
        let mut queue = queue.lock().await;

        let cancelled = {
            let mut slot = handle.slot.lock().await;
            self.cancel_locked(&mut slot, LogLevel::Warning, "run cancelled by request")
                .await
        };

        if cancelled {
            queue.release(run_id);
            self.settle(&mut queue).await;
        }
        Ok(cancelled)
    }

    /// 0 while active, 1..N while waiting, `None` once terminal.
    pub async fn queue_position(&self, run_id: RunId) -> Result<Option<usize>> {
        let handle = self.handle(run_id).await?;
        let queue = self.category_queue(&handle.category).await;
        let queue = queue.lock().await;
        Ok(queue.position(run_id))
    }

    pub async fn run(&self, run_id: RunId) -> Result<PipelineRun> {
        let handle = self.handle(run_id).await?;
        let slot = handle.slot.lock().await;
        Ok(slot.snapshot())
    }

    /// Every known run, oldest first.
    pub async fn runs(&self) -> Vec<PipelineRun> {
        let mut out = Vec::new();
        for handle in self.handles().await {
            out.push(handle.slot.lock().await.snapshot());
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    /// Task runs of a run, in node declaration order.
    pub async fn task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>> {
        let handle = self.handle(run_id).await?;
        let slot = handle.slot.lock().await;
        Ok(slot.scheduler.tasks().cloned().collect())
    }

    pub async fn task_run(&self, task_run_id: TaskRunId) -> Result<TaskRun> {
        let run_id = self.run_of(task_run_id).await?;
        let handle = self.handle(run_id).await?;
        let slot = handle.slot.lock().await;
        slot.scheduler
            .task_by_id(task_run_id)
            .cloned()
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))
    }

    /// Live log entries of a task run appended after this call.
    pub fn subscribe(&self, task_run_id: TaskRunId) -> Result<LogSubscription> {
        self.inner.logs.subscribe(task_run_id)
    }

    /// Replay from `offset`, then follow.
    pub fn subscribe_from(&self, task_run_id: TaskRunId, offset: u64) -> Result<LogSubscription> {
        self.inner.logs.subscribe_from(task_run_id, offset)
    }

    pub fn read_logs(&self, task_run_id: TaskRunId, offset: u64) -> Result<Vec<SequencedEntry>> {
        self.inner.logs.read(task_run_id, offset)
    }

    /// Wait until every store write queued so far has been applied.
    pub async fn flush(&self) {
        self.inner.persister.flush().await;
    }

    /// True when every known run is terminal.
    pub async fn is_idle(&self) -> bool {
        for handle in self.handles().await {
            if !handle.slot.lock().await.scheduler.is_finished() {
                return false;
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Runner callbacks
    // ---------------------------------------------------------------------

    /// Apply a task completion reported by the runner.
    ///
    /// Errors are reported to the caller and leave state untouched:
    /// `StaleCompletion` when the correlation id is not the task's current
    /// one, `DuplicateTransition` when the task is already terminal.
    pub async fn handle_completion(
        &self,
        correlation_id: CorrelationId,
        task_run_id: TaskRunId,
        outcome: RunnerOutcome,
    ) -> Result<()> {
        let run_id = self.run_of(task_run_id).await?;
        let handle = self.handle(run_id).await?;

        let just_finished = {
            let mut slot = handle.slot.lock().await;

            let node = slot
                .scheduler
                .node_of(task_run_id)
                .map(str::to_string)
                .ok_or(PipeflowError::TaskRunNotFound(task_run_id))?;

            let current = slot
                .scheduler
                .task(&node)
                .and_then(|t| t.correlation_id.clone());
            if current.as_ref() != Some(&correlation_id) {
                return Err(PipeflowError::StaleCompletion {
                    task_run: task_run_id,
                    correlation: correlation_id,
                });
            }

            let now = Utc::now();
            let step = match outcome {
                RunnerOutcome::Exited(code) => {
                    let step = slot.scheduler.complete(&node, code, now)?;
                    info!(run_id = %run_id, task = %node, exit_code = code, "task exited");
                    if code != 0 {
                        self.append_log(task_run_id, LogEntry::error(format!("exited with code {code}")));
                    }
                    step
                }
                RunnerOutcome::InfrastructureError(reason) => {
                    let step = slot.scheduler.fail(&node, &reason, now)?;
                    warn!(run_id = %run_id, task = %node, %reason, "task hit infrastructure error");
                    self.append_log(task_run_id, LogEntry::error(format!("infrastructure error: {reason}")));
                    step
                }
            };

            self.drive(&mut slot, step).await
        };

        if just_finished {
            self.settle_category(&handle.category).await;
        }
        Ok(())
    }

    /// Append a runner log line to its task's log.
    pub async fn handle_log_line(&self, task_run_id: TaskRunId, entry: LogEntry) -> Result<u64> {
        let seq = self.inner.logs.append(task_run_id, entry.clone())?;
        self.inner.persister.log(task_run_id, entry);
        Ok(seq)
    }

    // ---------------------------------------------------------------------
    // Periodic maintenance
    // ---------------------------------------------------------------------

    /// Cancel active runs that have been RUNNING longer than the configured
    /// maximum. Returns the reaped run ids; a second sweep is a no-op.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> Vec<RunId> {
        let max = TimeDelta::from_std(self.inner.settings.max_run_duration).unwrap_or(TimeDelta::MAX);
        let mut reaped = Vec::new();

        for queue in self.category_queues().await {
            let mut queue = queue.lock().await;
            let Some(active) = queue.active() else {
                continue;
            };
            let Some(handle) = self.lookup(active).await else {
                continue;
            };

            let cancelled = {
                let mut slot = handle.slot.lock().await;
                match slot.started_at {
                    Some(started) if now - started > max && !slot.scheduler.is_finished() => {
                        warn!(
                            run_id = %active,
                            category = %queue.category(),
                            elapsed_secs = (now - started).num_seconds(),
                            "run exceeded maximum duration; cancelling"
                        );
                        let message = format!(
                            "run cancelled: exceeded maximum duration of {}s",
                            self.inner.settings.max_run_duration.as_secs()
                        );
                        self.cancel_locked(&mut slot, LogLevel::Error, &message).await
                    }
                    _ => false,
                }
            };

            if cancelled {
                reaped.push(active);
                self.settle(&mut queue).await;
            }
        }

        reaped
    }

    /// Re-derive every category's active slot and queue positions.
    ///
    /// Returns how many categories changed their active run.
    pub async fn reconcile(&self) -> usize {
        let mut changed = 0;
        for queue in self.category_queues().await {
            let mut queue = queue.lock().await;
            let before = queue.active();
            self.settle(&mut queue).await;
            if queue.active() != before {
                debug!(category = %queue.category(), "reconciliation changed active run");
                changed += 1;
            }
        }
        changed
    }

    /// Rebuild in-memory state from a persisted snapshot.
    ///
    /// - Terminal runs are kept as history.
    /// - QUEUED/RUNNING tasks are failed as lost and the DAG re-evaluated.
    /// - Per category, the oldest previously running run keeps the slot;
    ///   other previously running runs are cancelled.
    /// - PENDING runs go back into their queue in creation order.
    pub async fn recover(&self, snapshot: StoreSnapshot) -> Result<RecoveryReport> {
        let now = Utc::now();
        let StoreSnapshot {
            runs,
            tasks,
            mut logs,
        } = snapshot;

        let mut tasks_by_run: HashMap<RunId, Vec<TaskRun>> = HashMap::new();
        for task in tasks {
            tasks_by_run.entry(task.run_id).or_default().push(task);
        }

        let mut report = RecoveryReport::default();
        // Per category, in creation order: (run, was admitted, step to apply).
        let mut by_category: BTreeMap<String, Vec<(RunId, bool, SchedulerStep)>> = BTreeMap::new();

        for record in runs {
            let run_id = record.run.id;
            if self.lookup(run_id).await.is_some() {
                debug!(run_id = %run_id, "run already known; skipping recovery");
                continue;
            }

            let graph = match PipelineGraph::from_definition(&record.definition) {
                Ok(graph) => Arc::new(graph),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "persisted run has an invalid definition; dropping");
                    continue;
                }
            };

            let tasks = tasks_by_run.remove(&run_id).unwrap_or_default();
            if tasks.len() != graph.len() || tasks.iter().any(|t| !graph.contains(&t.node)) {
                warn!(run_id = %run_id, "persisted run has incomplete task records; dropping");
                continue;
            }

            for task in &tasks {
                let history = logs.remove(&task.id).unwrap_or_default();
                self.inner
                    .logs
                    .restore(task.id, history, !task.state.is_terminal());
            }

            let admitted = record.run.started_at.is_some();
            let lost: Vec<(NodeId, TaskRunId)> = tasks
                .iter()
                .filter(|t| matches!(t.state, TaskState::Queued | TaskState::Running))
                .map(|t| (t.node.clone(), t.id))
                .collect();
            let task_ids: Vec<TaskRunId> = tasks.iter().map(|t| t.id).collect();

            let mut scheduler =
                DagScheduler::restore(run_id, graph, tasks, admitted, record.cancel_requested);

            let mut step = SchedulerStep::default();
            for (node, id) in lost {
                self.append_log(id, LogEntry::error("task lost on restart"));
                match scheduler.fail(&node, "lost on restart", now) {
                    Ok(s) => step.merge(s),
                    Err(err) => warn!(run_id = %run_id, task = %node, error = %err, "could not fail lost task"),
                }
                report.lost_tasks += 1;
            }
            step.merge(scheduler.resume(now));

            let finished = scheduler.is_finished();
            let slot = RunSlot {
                definition: record.definition,
                category: record.run.category.clone(),
                trigger: record.run.trigger,
                parameters: record.run.parameters,
                queue_position: None,
                created_at: record.run.created_at,
                started_at: record.run.started_at,
                completed_at: record.run.completed_at,
                scheduler,
            };

            {
                let mut index = self.inner.task_index.write().await;
                for id in task_ids {
                    index.insert(id, run_id);
                }
            }
            let handle = RunHandle {
                category: record.run.category.clone(),
                slot: Arc::new(Mutex::new(slot)),
            };
            self.inner.runs.write().await.insert(run_id, handle.clone());
            report.runs += 1;

            if finished {
                let mut slot = handle.slot.lock().await;
                self.publish_step(&slot, &step);
                self.finalize_if_finished(&mut slot);
            } else {
                by_category
                    .entry(record.run.category)
                    .or_default()
                    .push((run_id, admitted, step));
            }
        }

        for (category, entries) in by_category {
            let queue = self.category_queue(&category).await;
            let mut queue = queue.lock().await;
            let mut slot_taken = queue.active().is_some();

            // Previously running runs first, so a pending run never takes
            // the slot from one that was already executing.
            let (running, pending): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|(_, admitted, _)| *admitted);

            for (run_id, _, step) in running {
                let Some(handle) = self.lookup(run_id).await else {
                    continue;
                };
                let mut slot = handle.slot.lock().await;

                if slot_taken {
                    self.publish_step(&slot, &step);
                    self.cancel_locked(&mut slot, LogLevel::Error, "run cancelled: superseded on restart")
                        .await;
                    report.superseded += 1;
                    continue;
                }

                queue.admit(run_id, slot.created_at);
                slot_taken = true;
                info!(run_id = %run_id, %category, "resuming run after restart");
                self.drive(&mut slot, step).await;
                report.resumed += 1;
            }

            for (run_id, _, step) in pending {
                let Some(handle) = self.lookup(run_id).await else {
                    continue;
                };
                let created_at = {
                    let slot = handle.slot.lock().await;
                    self.publish_step(&slot, &step);
                    slot.created_at
                };
                queue.admit(run_id, created_at);
                report.requeued += 1;
            }

            self.settle(&mut queue).await;
        }

        info!(
            runs = report.runs,
            resumed = report.resumed,
            requeued = report.requeued,
            lost_tasks = report.lost_tasks,
            "engine state recovered"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn lookup(&self, run_id: RunId) -> Option<RunHandle> {
        self.inner.runs.read().await.get(&run_id).cloned()
    }

    async fn handle(&self, run_id: RunId) -> Result<RunHandle> {
        self.lookup(run_id)
            .await
            .ok_or(PipeflowError::RunNotFound(run_id))
    }

    async fn handles(&self) -> Vec<RunHandle> {
        self.inner.runs.read().await.values().cloned().collect()
    }

    async fn run_of(&self, task_run_id: TaskRunId) -> Result<RunId> {
        self.inner
            .task_index
            .read()
            .await
            .get(&task_run_id)
            .copied()
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))
    }

    async fn category_queue(&self, category: &str) -> Arc<Mutex<CategoryQueue>> {
        let mut categories = self.inner.categories.lock().await;
        Arc::clone(
            categories
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CategoryQueue::new(category)))),
        )
    }

    /// All category queues, ordered by category name.
    async fn category_queues(&self) -> Vec<Arc<Mutex<CategoryQueue>>> {
        let categories = self.inner.categories.lock().await;
        let mut names: Vec<&String> = categories.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| categories.get(n).cloned())
            .collect()
    }

    async fn settle_category(&self, category: &str) {
        let queue = self.category_queue(category).await;
        let mut queue = queue.lock().await;
        self.settle(&mut queue).await;
    }

    /// Bring a category to a consistent state: release a finished active
    /// run, promote and start the next one, then refresh positions.
    ///
    /// Caller holds the category lock.
    async fn settle(&self, queue: &mut CategoryQueue) {
        loop {
            let active = match queue.active().or_else(|| queue.promote()) {
                Some(id) => id,
                None => break,
            };

            let Some(handle) = self.lookup(active).await else {
                warn!(run_id = %active, category = %queue.category(), "active run is unknown; releasing slot");
                queue.release(active);
                continue;
            };

            let mut slot = handle.slot.lock().await;
            if !slot.scheduler.is_admitted() && !slot.scheduler.is_finished() {
                slot.queue_position = Some(0);
                self.start_locked(&mut slot).await;
            }

            if slot.scheduler.is_finished() {
                drop(slot);
                debug!(run_id = %active, category = %queue.category(), "releasing finished run");
                queue.release(active);
                continue;
            }
            break;
        }

        self.sync_positions(queue).await;
    }

    /// Copy queue positions into the run slots. Caller holds the category
    /// lock.
    async fn sync_positions(&self, queue: &CategoryQueue) {
        for (run_id, position) in queue.positions() {
            let Some(handle) = self.lookup(run_id).await else {
                continue;
            };
            let mut slot = handle.slot.lock().await;
            if slot.queue_position != Some(position) {
                slot.queue_position = Some(position);
                self.inner.persister.run(slot.record());
            }
        }
    }

    async fn start_locked(&self, slot: &mut RunSlot) {
        let now = Utc::now();
        let run_id = slot.scheduler.run_id();
        slot.started_at = Some(now);

        let step = slot.scheduler.admit(now);
        info!(run_id = %run_id, category = %slot.category, "run started");
        self.emit(RunEvent::RunStarted { run_id });
        self.inner.persister.run(slot.record());

        self.drive(slot, step).await;
    }

    /// Publish a step and dispatch everything it queued, feeding dispatch
    /// failures back into the scheduler until nothing new is queued.
    ///
    /// Returns true if the run finished during this call.
    async fn drive(&self, slot: &mut RunSlot, step: SchedulerStep) -> bool {
        let run_id = slot.scheduler.run_id();
        let mut pending = step;

        loop {
            self.publish_step(slot, &pending);

            let queued = std::mem::take(&mut pending.newly_queued);
            if queued.is_empty() {
                break;
            }

            let mut next = SchedulerStep::default();
            for task in queued {
                let node = task.node.clone();
                let task_run_id = task.task_run_id;

                match self.inner.runner.dispatch(task).await {
                    Ok(correlation) => {
                        debug!(run_id = %run_id, task = %node, %correlation, "task dispatched");
                        match slot.scheduler.mark_started(&node, correlation, Utc::now()) {
                            Ok(()) => self.publish_task(slot, &node),
                            Err(err) => warn!(run_id = %run_id, task = %node, error = %err, "could not mark task started"),
                        }
                    }
                    Err(err) => {
                        warn!(run_id = %run_id, task = %node, error = %err, "dispatch failed");
                        self.append_log(task_run_id, LogEntry::error(format!("dispatch failed: {err}")));
                        match slot.scheduler.fail(&node, &err.to_string(), Utc::now()) {
                            Ok(s) => next.merge(s),
                            Err(err) => warn!(run_id = %run_id, task = %node, error = %err, "could not fail task"),
                        }
                    }
                }
            }
            pending = next;
        }

        self.finalize_if_finished(slot)
    }

    /// Cancel every live task of a run. Returns false if the run was
    /// already terminal. Caller holds the run lock.
    async fn cancel_locked(&self, slot: &mut RunSlot, level: LogLevel, message: &str) -> bool {
        if slot.scheduler.is_finished() {
            return false;
        }

        let run_id = slot.scheduler.run_id();
        let mut in_flight: Vec<CorrelationId> = Vec::new();
        for task in slot.scheduler.tasks().filter(|t| !t.state.is_terminal()) {
            self.append_log(task.id, LogEntry::new(level, message));
            if task.state == TaskState::Running {
                in_flight.extend(task.correlation_id.clone());
            }
        }

        let step = slot.scheduler.cancel_all(Utc::now());
        info!(run_id = %run_id, cancelled_tasks = step.changed.len(), reason = %message, "run cancelled");

        for correlation in in_flight {
            if let Err(err) = self.inner.runner.cancel(&correlation).await {
                warn!(run_id = %run_id, %correlation, error = %err, "runner failed to cancel task");
            }
        }

        self.publish_step(slot, &step);
        self.finalize_if_finished(slot);
        true
    }

    fn publish_step(&self, slot: &RunSlot, step: &SchedulerStep) {
        for node in &step.changed {
            if step.newly_skipped.contains(node) {
                if let Some(task) = slot.scheduler.task(node) {
                    self.append_log(
                        task.id,
                        LogEntry::info("skipped: no incoming edge can be satisfied"),
                    );
                }
            }
            self.publish_task(slot, node);
        }
    }

    /// Persist a task record, notify observers, close its log when terminal.
    fn publish_task(&self, slot: &RunSlot, node: &str) {
        let Some(task) = slot.scheduler.task(node) else {
            return;
        };

        self.inner.persister.task(task.clone());
        self.emit(RunEvent::TaskStateChanged {
            run_id: task.run_id,
            task_run_id: task.id,
            node: task.node.clone(),
            state: task.state,
        });

        if task.state.is_terminal() {
            self.inner.logs.close(task.id);
        }
    }

    /// Stamp completion the first time a run is seen finished.
    fn finalize_if_finished(&self, slot: &mut RunSlot) -> bool {
        if !slot.scheduler.is_finished() || slot.completed_at.is_some() {
            return false;
        }

        let run_id = slot.scheduler.run_id();
        let state = slot.scheduler.state();
        slot.completed_at = Some(Utc::now());
        slot.queue_position = None;

        info!(run_id = %run_id, %state, "run finished");
        self.emit(RunEvent::RunFinished { run_id, state });
        self.inner.persister.run(slot.record());
        true
    }

    fn append_log(&self, task_run_id: TaskRunId, entry: LogEntry) {
        match self.inner.logs.append(task_run_id, entry.clone()) {
            Ok(_) => self.inner.persister.log(task_run_id, entry),
            Err(err) => debug!(task_run_id = %task_run_id, error = %err, "dropping log entry"),
        }
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dag::{PipelineState, ScheduledTask};
    use crate::template::{InMemoryTemplateStore, NodeDefinition, TaskDefinition};
    use crate::types::BoxFuture;

    #[derive(Default)]
    struct AcceptingRunner {
        dispatches: AtomicUsize,
    }

    impl RunnerBackend for AcceptingRunner {
        fn dispatch(&self, _task: ScheduledTask) -> BoxFuture<'_, Result<CorrelationId>> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(CorrelationId::generate()) })
        }

        fn cancel<'a>(&'a self, _correlation: &'a CorrelationId) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn single_node_engine(runner: Arc<AcceptingRunner>) -> Engine {
        let templates = InMemoryTemplateStore::new()
            .with_task(TaskDefinition {
                id: "x".into(),
                category: "alpha".into(),
                command: "echo x".into(),
                params: BTreeMap::new(),
                required: Default::default(),
            })
            .with_pipeline(PipelineDefinition {
                id: "job".into(),
                category: None,
                nodes: vec![NodeDefinition {
                    id: "x".into(),
                    task: "x".into(),
                    position: None,
                    params: BTreeMap::new(),
                }],
                edges: Vec::new(),
            });
        Engine::new(
            Arc::new(templates),
            runner,
            EngineSettings::default(),
            Persister::disabled(),
        )
    }

    #[tokio::test]
    async fn reconcile_promotes_oldest_waiting_run_after_a_missed_release() -> Result<()> {
        let runner = Arc::new(AcceptingRunner::default());
        let engine = single_node_engine(runner.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(engine.create_run("job", TriggerKind::Manual, BTreeMap::new()).await?);
        }
        let (r1, r2, r3) = (ids[0], ids[1], ids[2]);
        assert_eq!(runner.dispatches.load(Ordering::SeqCst), 1);

        // Finish r1 inside its scheduler only, leaving the category queue
        // pointing at it.
        {
            let handle = engine.handle(r1).await?;
            let mut slot = handle.slot.lock().await;
            slot.scheduler.complete("x", 0, Utc::now())?;
            assert!(slot.scheduler.is_finished());
        }
        assert_eq!(engine.queue_position(r1).await?, Some(0));
        assert_eq!(engine.run(r2).await?.state, PipelineState::Pending);

        assert_eq!(engine.reconcile().await, 1);

        assert_eq!(engine.queue_position(r1).await?, None);
        assert_eq!(engine.queue_position(r2).await?, Some(0));
        assert_eq!(engine.queue_position(r3).await?, Some(1));
        let promoted = engine.run(r2).await?;
        assert_eq!(promoted.state, PipelineState::Running);
        assert_eq!(promoted.queue_position, Some(0));
        assert_eq!(engine.run(r3).await?.queue_position, Some(1));
        assert_eq!(runner.dispatches.load(Ordering::SeqCst), 2);

        // Nothing left to repair.
        assert_eq!(engine.reconcile().await, 0);
        Ok(())
    }
}
