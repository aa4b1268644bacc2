#![allow(dead_code)]

use std::collections::BTreeMap;

use pipeflow::template::{EdgeDefinition, NodeDefinition, PipelineDefinition, TaskDefinition};
use pipeflow::types::EdgeCondition;

/// Builder for `TaskDefinition`.
pub struct TaskBuilder {
    task: TaskDefinition,
}

impl TaskBuilder {
    pub fn new(id: &str, category: &str) -> Self {
        Self {
            task: TaskDefinition {
                id: id.to_string(),
                category: category.to_string(),
                command: format!("echo {id}"),
                params: BTreeMap::new(),
                required: Default::default(),
            },
        }
    }

    pub fn command(mut self, command: &str) -> Self {
        self.task.command = command.to_string();
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.task.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn require(mut self, key: &str) -> Self {
        self.task.required.insert(key.to_string());
        self
    }

    pub fn build(self) -> TaskDefinition {
        self.task
    }
}

/// Builder for `PipelineDefinition`.
///
/// Nodes added with [`node`](Self::node) reference a task of the same id.
pub struct PipelineBuilder {
    pipeline: PipelineDefinition,
}

impl PipelineBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            pipeline: PipelineDefinition {
                id: id.to_string(),
                category: None,
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    pub fn category(mut self, category: &str) -> Self {
        self.pipeline.category = Some(category.to_string());
        self
    }

    pub fn node(self, id: &str) -> Self {
        self.node_of(id, id)
    }

    /// Node `id` placing task definition `task`.
    pub fn node_of(mut self, id: &str, task: &str) -> Self {
        self.pipeline.nodes.push(NodeDefinition {
            id: id.to_string(),
            task: task.to_string(),
            position: None,
            params: BTreeMap::new(),
        });
        self
    }

    /// Position-level parameter on the most recently added node.
    pub fn node_param(mut self, key: &str, value: &str) -> Self {
        if let Some(node) = self.pipeline.nodes.last_mut() {
            node.params.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn edge(mut self, from: &str, to: &str, on: EdgeCondition) -> Self {
        self.pipeline.edges.push(EdgeDefinition {
            from: from.to_string(),
            to: to.to_string(),
            on,
        });
        self
    }

    pub fn on_success(self, from: &str, to: &str) -> Self {
        self.edge(from, to, EdgeCondition::Success)
    }

    pub fn on_failure(self, from: &str, to: &str) -> Self {
        self.edge(from, to, EdgeCondition::Failure)
    }

    pub fn build(self) -> PipelineDefinition {
        self.pipeline
    }
}
