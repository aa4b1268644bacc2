// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::dag::TaskState;
use crate::types::{CorrelationId, NodeId, RunId, TaskRunId};

#[derive(Error, Debug)]
pub enum PipeflowError {
    /// Malformed template or parameters; nothing was created.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected in pipeline graph: {0}")]
    DagCycle(String),

    #[error("Unknown pipeline definition: {0}")]
    UnknownPipeline(String),

    #[error("Unknown task definition: {0}")]
    UnknownTask(String),

    #[error("Pipeline run not found: {0}")]
    RunNotFound(RunId),

    #[error("Task run not found: {0}")]
    TaskRunNotFound(TaskRunId),

    /// The task is already terminal; the transition was not applied.
    #[error("Duplicate transition: task '{task}' is already {state}, cannot apply '{event}'")]
    DuplicateTransition {
        task: NodeId,
        state: TaskState,
        event: String,
    },

    #[error("Invalid transition: task '{task}' in state {state} cannot apply '{event}'")]
    InvalidTransition {
        task: NodeId,
        state: TaskState,
        event: String,
    },

    #[error("Stale completion for task run {task_run}: correlation {correlation} is not current")]
    StaleCompletion {
        task_run: TaskRunId,
        correlation: CorrelationId,
    },

    /// Runner unreachable or dispatch failed.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipeflowError {
    /// True for errors that reject a template at materialization time.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipeflowError::Validation(_)
                | PipeflowError::DagCycle(_)
                | PipeflowError::UnknownPipeline(_)
                | PipeflowError::UnknownTask(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipeflowError>;
