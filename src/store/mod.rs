// src/store/mod.rs

//! Persistence contract for runs, task runs and logs.
//!
//! The engine never waits on the store: every write goes through the
//! write-behind [`Persister`]. On restart, [`RunStore::load_snapshot`]
//! feeds `Engine::recover`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dag::TaskRun;
use crate::engine::PipelineRun;
use crate::errors::Result;
use crate::logs::LogEntry;
use crate::template::PipelineDefinition;
use crate::types::{BoxFuture, TaskRunId};

pub mod memory;
pub mod persister;

pub use memory::InMemoryRunStore;
pub use persister::Persister;

/// Durable form of a pipeline run.
///
/// Carries the definition it was materialized from so a run can be resumed
/// even if the template store changed in the meantime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: PipelineRun,
    pub definition: PipelineDefinition,
    pub cancel_requested: bool,
}

/// Everything needed to rebuild the engine after a restart.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Ordered by creation time.
    pub runs: Vec<RunRecord>,
    pub tasks: Vec<TaskRun>,
    pub logs: HashMap<TaskRunId, Vec<LogEntry>>,
}

/// Trait abstracting where run state is persisted.
pub trait RunStore: Send + Sync {
    fn upsert_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>>;

    fn upsert_task(&self, task: TaskRun) -> BoxFuture<'_, Result<()>>;

    fn append_log(&self, task_run_id: TaskRunId, entry: LogEntry) -> BoxFuture<'_, Result<()>>;

    fn load_snapshot(&self) -> BoxFuture<'_, Result<StoreSnapshot>>;
}
