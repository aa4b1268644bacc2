// src/store/persister.rs

//! Write-behind queue in front of a [`RunStore`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::dag::TaskRun;
use crate::logs::LogEntry;
use crate::store::{RunRecord, RunStore};
use crate::types::TaskRunId;

#[derive(Debug)]
enum PersistOp {
    Run(Box<RunRecord>),
    Task(Box<TaskRun>),
    Log(TaskRunId, LogEntry),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle for queueing store writes.
///
/// Writes are applied in submission order by a single background worker;
/// callers never wait for them. Store errors are logged and dropped.
#[derive(Debug, Clone)]
pub struct Persister {
    tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl Persister {
    /// A persister that discards every write.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the background worker on the current Tokio runtime.
    pub fn spawn(store: Arc<dyn RunStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();

        tokio::spawn(async move {
            debug!("persister worker started");
            while let Some(op) = rx.recv().await {
                let res = match op {
                    PersistOp::Run(record) => store.upsert_run(*record).await,
                    PersistOp::Task(task) => store.upsert_task(*task).await,
                    PersistOp::Log(id, entry) => store.append_log(id, entry).await,
                    PersistOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(err) = res {
                    warn!(error = %err, "failed to persist record; continuing");
                }
            }
            debug!("persister worker exiting");
        });

        Self { tx: Some(tx) }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn run(&self, record: RunRecord) {
        self.submit(PersistOp::Run(Box::new(record)));
    }

    pub fn task(&self, task: TaskRun) {
        self.submit(PersistOp::Task(Box::new(task)));
    }

    pub fn log(&self, task_run_id: TaskRunId, entry: LogEntry) {
        self.submit(PersistOp::Log(task_run_id, entry));
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn submit(&self, op: PersistOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                warn!("persister worker gone; dropping write");
            }
        }
    }
}
