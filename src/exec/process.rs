// src/exec/process.rs

//! Runner that executes task commands as local shell processes.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dag::ScheduledTask;
use crate::engine::{RunnerOutcome, RuntimeEvent};
use crate::errors::{PipeflowError, Result};
use crate::exec::backend::RunnerBackend;
use crate::logs::{LogEntry, LogLevel};
use crate::types::{BoxFuture, CorrelationId, TaskRunId};

type CancelMap = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<()>>>>;

/// Runs each task with `sh -c` (`cmd /C` on Windows).
///
/// - Parameters become environment variables, plus `PIPEFLOW_RUN_ID` and
///   `PIPEFLOW_TASK_RUN_ID`.
/// - stdout lines are reported as `info` log lines, stderr as `warning`.
/// - A `TaskCompleted` event follows the last log line of the task.
/// - A cancelled task is killed and **no** `TaskCompleted` is sent for it.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    events: mpsc::Sender<RuntimeEvent>,
    in_flight: CancelMap,
}

impl ProcessRunner {
    pub fn new(events: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            events,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_child(task: &ScheduledTask) -> anyhow::Result<Child> {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&task.command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&task.command);
            c
        };

        cmd.envs(&task.parameters)
            .env("PIPEFLOW_RUN_ID", task.run_id.to_string())
            .env("PIPEFLOW_TASK_RUN_ID", task.task_run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .with_context(|| format!("spawning process for task '{}'", task.node))
    }
}

impl RunnerBackend for ProcessRunner {
    fn dispatch(&self, task: ScheduledTask) -> BoxFuture<'_, Result<CorrelationId>> {
        Box::pin(async move {
            let child = Self::spawn_child(&task)
                .map_err(|e| PipeflowError::Infrastructure(format!("{e:#}")))?;

            let correlation = CorrelationId::generate();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(correlation.clone(), cancel_tx);

            info!(
                task = %task.node,
                run_id = %task.run_id,
                %correlation,
                cmd = %task.command,
                "task process started"
            );

            tokio::spawn(supervise(
                child,
                task.task_run_id,
                task.node,
                correlation.clone(),
                self.events.clone(),
                cancel_rx,
                Arc::clone(&self.in_flight),
            ));

            Ok(correlation)
        })
    }

    fn cancel<'a>(&'a self, correlation: &'a CorrelationId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sender = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(correlation);

            match sender {
                Some(tx) => {
                    debug!(%correlation, "cancellation requested for running task");
                    let _ = tx.send(());
                }
                None => debug!(%correlation, "cancel for unknown or finished task ignored"),
            }
            Ok(())
        })
    }
}

/// Own one child process until it exits or is cancelled.
async fn supervise(
    mut child: Child,
    task_run_id: TaskRunId,
    node: String,
    correlation: CorrelationId,
    events: mpsc::Sender<RuntimeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    in_flight: CancelMap,
) {
    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|s| forward_lines(s, LogLevel::Info, task_run_id, events.clone())),
        child
            .stderr
            .take()
            .map(|s| forward_lines(s, LogLevel::Warning, task_run_id, events.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    // Either the process exits on its own (normal case), or we receive a
    // cancellation request.
    let outcome = tokio::select! {
        status = child.wait() => Some(outcome_of(status, &node)),
        cancel = &mut cancel_rx => {
            if cancel.is_ok() {
                info!(task = %node, %correlation, "killing cancelled task process");
                if let Err(e) = child.kill().await {
                    warn!(task = %node, error = %e, "failed to kill child process on cancellation");
                }
            }
            None
        }
    };

    // Drain output so every log line precedes the completion.
    for reader in readers {
        let _ = reader.await;
    }

    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&correlation);

    let Some(outcome) = outcome else {
        return;
    };

    if events
        .send(RuntimeEvent::TaskCompleted {
            correlation_id: correlation,
            task_run_id,
            outcome,
        })
        .await
        .is_err()
    {
        error!(task = %node, "runtime gone; completion dropped");
    }
}

fn outcome_of(status: std::io::Result<ExitStatus>, node: &str) -> RunnerOutcome {
    match status {
        Ok(status) => match status.code() {
            Some(code) => {
                info!(task = %node, exit_code = code, success = status.success(), "task process exited");
                RunnerOutcome::Exited(code)
            }
            None => {
                warn!(task = %node, "task process terminated by signal");
                RunnerOutcome::InfrastructureError("process terminated by signal".to_string())
            }
        },
        Err(e) => RunnerOutcome::InfrastructureError(format!("waiting for process: {e}")),
    }
}

fn forward_lines<R>(
    stream: R,
    level: LogLevel,
    task_run_id: TaskRunId,
    events: mpsc::Sender<RuntimeEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let entry = LogEntry::new(level, line);
            if events
                .send(RuntimeEvent::LogLine { task_run_id, entry })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}
