// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::duration::parse_duration;
use crate::config::model::{ConfigFile, EngineSection, EngineSettings, RawConfigFile};
use crate::dag::PipelineGraph;
use crate::errors::{PipeflowError, Result};
use crate::template::{InMemoryTemplateStore, PipelineDefinition, TaskDefinition};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = PipeflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let engine = validate_engine(&raw.engine)?;
        let templates = build_templates(raw)?;
        Ok(ConfigFile::new_unchecked(engine, templates))
    }
}

fn validate_engine(section: &EngineSection) -> Result<EngineSettings> {
    let max_run_duration = positive_duration("max_run_duration", &section.max_run_duration)?;
    let reaper_interval = positive_duration("reaper_interval", &section.reaper_interval)?;

    if section.subscriber_buffer == 0 {
        return Err(PipeflowError::ConfigError(
            "[engine].subscriber_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.event_buffer == 0 {
        return Err(PipeflowError::ConfigError(
            "[engine].event_buffer must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(EngineSettings {
        max_run_duration,
        reaper_interval,
        subscriber_buffer: section.subscriber_buffer,
        event_buffer: section.event_buffer,
    })
}

fn positive_duration(key: &str, value: &str) -> Result<std::time::Duration> {
    let d = parse_duration(value)
        .map_err(|e| PipeflowError::ConfigError(format!("[engine].{key}: {e}")))?;
    if d.is_zero() {
        return Err(PipeflowError::ConfigError(format!(
            "[engine].{key} must be greater than zero"
        )));
    }
    Ok(d)
}

fn build_templates(raw: RawConfigFile) -> Result<InMemoryTemplateStore> {
    let mut store = InMemoryTemplateStore::new();

    for (id, task) in raw.task {
        if task.command.trim().is_empty() {
            return Err(PipeflowError::ConfigError(format!(
                "task '{id}' has an empty `command`"
            )));
        }
        if task.category.trim().is_empty() {
            return Err(PipeflowError::ConfigError(format!(
                "task '{id}' has an empty `category`"
            )));
        }

        store.insert_task(TaskDefinition {
            id,
            category: task.category,
            command: task.command,
            params: task.params,
            required: task.required.into_iter().collect::<BTreeSet<_>>(),
        });
    }

    for (id, pipeline) in raw.pipeline {
        let def = PipelineDefinition {
            id: id.clone(),
            category: pipeline.category,
            nodes: pipeline.nodes,
            edges: pipeline.edges,
        };
        validate_pipeline(&store, &def)?;
        store.insert_pipeline(def);
    }

    Ok(store)
}

fn validate_pipeline(store: &InMemoryTemplateStore, def: &PipelineDefinition) -> Result<()> {
    use crate::template::TemplateStore;

    for node in &def.nodes {
        if store.task(&node.task).is_none() {
            return Err(PipeflowError::ConfigError(format!(
                "pipeline '{}': node '{}' references unknown task '{}'",
                def.id, node.id, node.task
            )));
        }
    }

    match PipelineGraph::from_definition(def) {
        Ok(_) => Ok(()),
        Err(PipeflowError::DagCycle(msg)) => Err(PipeflowError::DagCycle(format!(
            "pipeline '{}': {}",
            def.id, msg
        ))),
        Err(other) => Err(PipeflowError::ConfigError(format!(
            "pipeline '{}': {}",
            def.id, other
        ))),
    }
}
