use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use pipeflow::dag::ScheduledTask;
use pipeflow::engine::{RunnerOutcome, RuntimeEvent};
use pipeflow::errors::{PipeflowError, Result};
use pipeflow::exec::RunnerBackend;
use pipeflow::logs::LogEntry;
use pipeflow::types::{BoxFuture, CorrelationId};

/// One accepted dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub task: ScheduledTask,
    pub correlation: CorrelationId,
}

/// A fake runner that:
/// - records which tasks were dispatched and which were cancelled
/// - can be told to reject dispatches for given nodes
/// - in auto mode, reports a log line and a completion for every dispatch
///   (exit code 0 unless overridden per node)
///
/// In manual mode nothing is reported; tests drive completions through
/// `Engine::handle_completion` themselves.
#[derive(Default)]
pub struct FakeRunner {
    events: Option<mpsc::Sender<RuntimeEvent>>,
    exit_codes: Mutex<HashMap<String, i32>>,
    reject: Mutex<HashSet<String>>,
    dispatched: Mutex<Vec<Dispatched>>,
    cancelled: Mutex<Vec<CorrelationId>>,
}

impl FakeRunner {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto(events: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// In auto mode, `node` exits with `code`.
    pub fn exit_code(self, node: &str, code: i32) -> Self {
        self.exit_codes.lock().unwrap().insert(node.to_string(), code);
        self
    }

    /// Dispatches of `node` fail as if the runner were unreachable.
    pub fn reject(self, node: &str) -> Self {
        self.reject.lock().unwrap().insert(node.to_string());
        self
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatched_nodes(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.task.node.clone())
            .collect()
    }

    /// Most recent dispatch of `node`, across runs.
    pub fn last_dispatch_of(&self, node: &str) -> Option<Dispatched> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|d| d.task.node == node)
            .cloned()
    }

    pub fn cancelled(&self) -> Vec<CorrelationId> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl RunnerBackend for FakeRunner {
    fn dispatch(&self, task: ScheduledTask) -> BoxFuture<'_, Result<CorrelationId>> {
        Box::pin(async move {
            if self.reject.lock().unwrap().contains(&task.node) {
                return Err(PipeflowError::Infrastructure(format!(
                    "runner unreachable for '{}'",
                    task.node
                )));
            }

            let correlation = CorrelationId::generate();
            self.dispatched.lock().unwrap().push(Dispatched {
                task: task.clone(),
                correlation: correlation.clone(),
            });

            if let Some(tx) = &self.events {
                let code = self
                    .exit_codes
                    .lock()
                    .unwrap()
                    .get(&task.node)
                    .copied()
                    .unwrap_or(0);
                let tx = tx.clone();
                let correlation = correlation.clone();

                // Never await the channel inside dispatch: the engine holds
                // the run lock here and the runtime may be the caller.
                tokio::spawn(async move {
                    let _ = tx
                        .send(RuntimeEvent::LogLine {
                            task_run_id: task.task_run_id,
                            entry: LogEntry::info(format!("running {}", task.command)),
                        })
                        .await;
                    let _ = tx
                        .send(RuntimeEvent::TaskCompleted {
                            correlation_id: correlation,
                            task_run_id: task.task_run_id,
                            outcome: RunnerOutcome::Exited(code),
                        })
                        .await;
                });
            }

            Ok(correlation)
        })
    }

    fn cancel<'a>(&'a self, correlation: &'a CorrelationId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cancelled.lock().unwrap().push(correlation.clone());
            Ok(())
        })
    }
}
