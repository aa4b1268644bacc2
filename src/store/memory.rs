// src/store/memory.rs

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::dag::TaskRun;
use crate::errors::Result;
use crate::logs::LogEntry;
use crate::store::{RunRecord, RunStore, StoreSnapshot};
use crate::types::{BoxFuture, RunId, TaskRunId};

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, RunRecord>,
    tasks: HashMap<TaskRunId, TaskRun>,
    logs: HashMap<TaskRunId, Vec<LogEntry>>,
}

/// Process-local [`RunStore`]. Survives engine restarts within one process,
/// which is what the binary and the recovery tests need.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    tables: Mutex<Tables>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, id: RunId) -> Option<RunRecord> {
        self.tables.lock().await.runs.get(&id).cloned()
    }

    pub async fn task(&self, id: TaskRunId) -> Option<TaskRun> {
        self.tables.lock().await.tasks.get(&id).cloned()
    }

    pub async fn logs(&self, id: TaskRunId) -> Vec<LogEntry> {
        self.tables
            .lock()
            .await
            .logs
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl RunStore for InMemoryRunStore {
    fn upsert_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tables.lock().await.runs.insert(record.run.id, record);
            Ok(())
        })
    }

    fn upsert_task(&self, task: TaskRun) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tables.lock().await.tasks.insert(task.id, task);
            Ok(())
        })
    }

    fn append_log(&self, task_run_id: TaskRunId, entry: LogEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tables
                .lock()
                .await
                .logs
                .entry(task_run_id)
                .or_default()
                .push(entry);
            Ok(())
        })
    }

    fn load_snapshot(&self) -> BoxFuture<'_, Result<StoreSnapshot>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;

            let mut runs: Vec<RunRecord> = tables.runs.values().cloned().collect();
            runs.sort_by_key(|r| (r.run.created_at, r.run.id));

            Ok(StoreSnapshot {
                runs,
                tasks: tables.tasks.values().cloned().collect(),
                logs: tables.logs.clone(),
            })
        })
    }
}
