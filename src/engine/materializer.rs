// src/engine/materializer.rs

//! Template + trigger -> pipeline run with one task run per node.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::dag::{PipelineGraph, TaskRun};
use crate::errors::{PipeflowError, Result};
use crate::template::{PipelineDefinition, TemplateStore};
use crate::types::{RunId, TriggerKind};

/// A freshly materialized run. Every task run is PENDING.
#[derive(Debug, Clone)]
pub struct MaterializedRun {
    pub run_id: RunId,
    pub definition: PipelineDefinition,
    pub graph: Arc<PipelineGraph>,
    pub category: String,
    pub trigger: TriggerKind,
    pub parameters: BTreeMap<String, String>,
    /// In node declaration order.
    pub tasks: Vec<TaskRun>,
    pub created_at: DateTime<Utc>,
}

pub struct Materializer<'a> {
    templates: &'a dyn TemplateStore,
}

impl<'a> Materializer<'a> {
    pub fn new(templates: &'a dyn TemplateStore) -> Self {
        Self { templates }
    }

    /// Resolve `pipeline_id` and build its run.
    ///
    /// Fails with a validation error (nothing is created) when the pipeline
    /// or one of its tasks is unknown, the graph is malformed or cyclic, or a
    /// required parameter is missing after overlays.
    pub fn materialize(
        &self,
        pipeline_id: &str,
        trigger: TriggerKind,
        overrides: BTreeMap<String, String>,
    ) -> Result<MaterializedRun> {
        let definition = self
            .templates
            .pipeline(pipeline_id)
            .ok_or_else(|| PipeflowError::UnknownPipeline(pipeline_id.to_string()))?;

        let graph = PipelineGraph::from_definition(&definition)?;
        let run_id = RunId::new();

        let mut tasks = Vec::with_capacity(definition.nodes.len());
        let mut category = definition.category.clone();

        for node in &definition.nodes {
            let task = self.templates.task(&node.task).ok_or_else(|| {
                PipeflowError::UnknownTask(format!(
                    "{} (referenced by node '{}' of pipeline '{}')",
                    node.task, node.id, definition.id
                ))
            })?;

            if category.is_none() {
                category = Some(task.category.clone());
            }

            // template < run < position
            let mut parameters = task.params.clone();
            parameters.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
            parameters.extend(node.params.iter().map(|(k, v)| (k.clone(), v.clone())));

            let missing: Vec<&str> = task
                .required
                .iter()
                .filter(|k| !parameters.contains_key(*k))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(PipeflowError::Validation(format!(
                    "node '{}' of pipeline '{}' is missing required parameter(s): {}",
                    node.id,
                    definition.id,
                    missing.join(", ")
                )));
            }

            tasks.push(TaskRun::new(
                run_id,
                node.id.clone(),
                task.id.clone(),
                task.command.clone(),
                parameters,
            ));
        }

        let category = category
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                PipeflowError::Validation(format!(
                    "pipeline '{}' resolves to an empty category",
                    definition.id
                ))
            })?;

        debug!(
            run_id = %run_id,
            pipeline = %definition.id,
            %category,
            tasks = tasks.len(),
            "pipeline run materialized"
        );

        Ok(MaterializedRun {
            run_id,
            definition,
            graph: Arc::new(graph),
            category,
            trigger,
            parameters: overrides,
            tasks,
            created_at: Utc::now(),
        })
    }
}
