// src/engine/runtime.rs

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{PipeflowError, Result};

use super::core::Engine;
use super::{RunEvent, RuntimeEvent, RuntimeOptions};

/// Feeds `RuntimeEvent`s from the runner into the [`Engine`].
///
/// Events are applied one at a time in arrival order, so completions of the
/// same run are never reordered. Errors from individual events are logged
/// and never stop the loop.
#[derive(Debug)]
pub struct Runtime {
    engine: Engine,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    options: RuntimeOptions,
}

impl Runtime {
    pub fn new(engine: Engine, event_rx: mpsc::Receiver<RuntimeEvent>, options: RuntimeOptions) -> Self {
        Self {
            engine,
            event_rx,
            options,
        }
    }

    /// Main event loop.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx`.
    /// - Applies completions and log lines to the engine.
    /// - Stops on `ShutdownRequested`, when the channel closes, or (with
    ///   `exit_when_idle`) once every run is terminal.
    pub async fn run(mut self) -> Result<()> {
        info!("pipeflow runtime started");

        // Runs can also finish outside this loop (cancel requests, the
        // reaper), so idleness is re-checked on every RunFinished.
        let mut run_events = self.engine.events();

        if self.should_exit().await {
            info!("no live runs; exiting immediately");
            return Ok(());
        }

        loop {
            let event = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(e) => e,
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
                notice = run_events.recv() => {
                    match notice {
                        Ok(RunEvent::RunFinished { .. }) | Err(RecvError::Lagged(_)) => {
                            if self.should_exit().await {
                                info!("all runs terminal; stopping runtime");
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => {}
                    }
                    continue;
                }
            };

            debug!(?event, "runtime received event");

            match event {
                RuntimeEvent::TaskCompleted {
                    correlation_id,
                    task_run_id,
                    outcome,
                } => {
                    if let Err(err) = self
                        .engine
                        .handle_completion(correlation_id, task_run_id, outcome)
                        .await
                    {
                        report(&err);
                    }
                    if self.should_exit().await {
                        info!("all runs terminal; stopping runtime");
                        break;
                    }
                }
                RuntimeEvent::LogLine { task_run_id, entry } => {
                    if let Err(err) = self.engine.handle_log_line(task_run_id, entry).await {
                        debug!(task_run_id = %task_run_id, error = %err, "dropping log line");
                    }
                }
                RuntimeEvent::ShutdownRequested => {
                    info!("shutdown requested; stopping runtime");
                    break;
                }
            }
        }

        info!("runtime exiting");
        Ok(())
    }

    async fn should_exit(&self) -> bool {
        self.options.exit_when_idle && self.engine.is_idle().await
    }
}

fn report(err: &PipeflowError) {
    match err {
        PipeflowError::StaleCompletion { .. } | PipeflowError::DuplicateTransition { .. } => {
            debug!(error = %err, "ignoring completion")
        }
        _ => warn!(error = %err, "failed to apply completion"),
    }
}
