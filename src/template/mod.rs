// src/template/mod.rs

//! Immutable task and pipeline definitions, and the read-only store the
//! engine resolves them from.
//!
//! Definitions usually come from the `[task.*]` / `[pipeline.*]` sections of
//! the config file (see [`crate::config`]), but anything implementing
//! [`TemplateStore`] can back the engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{EdgeCondition, NodeId};

/// A reusable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    /// Execution partition key.
    pub category: String,
    /// Opaque command handed to the runner.
    pub command: String,
    /// Template-level parameter defaults.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Keys that must be present in the effective parameter set.
    #[serde(default)]
    pub required: BTreeSet<String>,
}

/// One placement of a task definition inside a pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    /// Id of the referenced [`TaskDefinition`].
    pub task: String,
    /// Layout hint; carried through untouched.
    #[serde(default)]
    pub position: Option<[i64; 2]>,
    /// Position-level parameter overrides (highest precedence).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Directed edge `from -> to`, firing when `from` ends in a state matching `on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub on: EdgeCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    /// Category override; defaults to the first node's task category.
    #[serde(default)]
    pub category: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// Read-only access to definitions.
pub trait TemplateStore: Send + Sync {
    fn pipeline(&self, id: &str) -> Option<PipelineDefinition>;
    fn task(&self, id: &str) -> Option<TaskDefinition>;
}

/// Map-backed [`TemplateStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    tasks: HashMap<String, TaskDefinition>,
    pipelines: HashMap<String, PipelineDefinition>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&mut self, task: TaskDefinition) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn insert_pipeline(&mut self, pipeline: PipelineDefinition) {
        self.pipelines.insert(pipeline.id.clone(), pipeline);
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.insert_task(task);
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineDefinition) -> Self {
        self.insert_pipeline(pipeline);
        self
    }

    /// Task definitions sorted by id.
    pub fn tasks(&self) -> Vec<&TaskDefinition> {
        let mut tasks: Vec<_> = self.tasks.values().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Pipeline definitions sorted by id.
    pub fn pipelines(&self) -> Vec<&PipelineDefinition> {
        let mut pipelines: Vec<_> = self.pipelines.values().collect();
        pipelines.sort_by(|a, b| a.id.cmp(&b.id));
        pipelines
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn pipeline(&self, id: &str) -> Option<PipelineDefinition> {
        self.pipelines.get(id).cloned()
    }

    fn task(&self, id: &str) -> Option<TaskDefinition> {
        self.tasks.get(id).cloned()
    }
}
