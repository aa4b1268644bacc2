// src/engine/mod.rs

//! Orchestration engine for pipeflow.
//!
//! This module ties together:
//! - the run materializer (template + trigger -> pipeline run)
//! - the per-category run queue (one active run per category)
//! - the async [`Engine`] that owns every run and talks to the runner
//! - the [`Runtime`] event loop that feeds runner events into the engine
//! - the stale run reaper
//!
//! The pure pieces ([`CategoryQueue`], `dag::DagScheduler`, the
//! [`Materializer`]) carry the semantics and are unit tested without Tokio;
//! [`core`] is the locking and IO shell around them.

use serde::{Deserialize, Serialize};

use crate::dag::{PipelineState, TaskState};
use crate::logs::LogEntry;
use crate::types::{CorrelationId, NodeId, RunId, TaskRunId};

/// How a dispatched task ended, as reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerOutcome {
    /// The command ran and exited with this code.
    Exited(i32),
    /// The task could not run to an exit code.
    InfrastructureError(String),
}

/// Runtime options used by the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// If true, exit the runtime once every known run is terminal
    /// (used for `--once`).
    pub exit_when_idle: bool,
}

/// Events flowing into the runtime from the runner and signal handlers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A dispatched task finished.
    TaskCompleted {
        correlation_id: CorrelationId,
        task_run_id: TaskRunId,
        outcome: RunnerOutcome,
    },
    /// One line of task output.
    LogLine {
        task_run_id: TaskRunId,
        entry: LogEntry,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Notifications for observers of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    RunQueued {
        run_id: RunId,
        category: String,
        position: usize,
    },
    RunStarted {
        run_id: RunId,
    },
    RunFinished {
        run_id: RunId,
        state: PipelineState,
    },
    TaskStateChanged {
        run_id: RunId,
        task_run_id: TaskRunId,
        node: NodeId,
        state: TaskState,
    },
}

pub mod core;
pub mod materializer;
pub mod queue;
pub mod reaper;
pub mod run;
pub mod runtime;

pub use core::{Engine, RecoveryReport};
pub use materializer::{MaterializedRun, Materializer};
pub use queue::{Admission, CategoryQueue};
pub use reaper::{spawn_reaper, ReaperHandle};
pub use run::PipelineRun;
pub use runtime::Runtime;
