// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::template::{EdgeDefinition, InMemoryTemplateStore, NodeDefinition};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// max_run_duration = "30m"
/// reaper_interval = "30s"
///
/// [task.build]
/// category = "ci"
/// command = "cargo build"
///
/// [pipeline.release]
/// [[pipeline.release.node]]
/// id = "build"
/// task = "build"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    /// Task definitions from `[task.<id>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// Pipeline definitions from `[pipeline.<id>]`.
    #[serde(default)]
    pub pipeline: BTreeMap<String, PipelineConfig>,
}

/// `[engine]` section. Durations use an `ms`/`s`/`m`/`h` suffix.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Runs RUNNING longer than this are cancelled by the reaper.
    #[serde(default = "default_max_run_duration")]
    pub max_run_duration: String,

    /// How often the reaper sweeps and reconciles category queues.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval: String,

    /// Per-subscriber live log buffer.
    #[serde(default = "default_buffer")]
    pub subscriber_buffer: usize,

    /// Capacity of the runner -> engine event channel.
    #[serde(default = "default_buffer")]
    pub event_buffer: usize,
}

fn default_max_run_duration() -> String {
    "1h".to_string()
}

fn default_reaper_interval() -> String {
    "30s".to_string()
}

fn default_buffer() -> usize {
    256
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_run_duration: default_max_run_duration(),
            reaper_interval: default_reaper_interval(),
            subscriber_buffer: default_buffer(),
            event_buffer: default_buffer(),
        }
    }
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub category: String,
    pub command: String,

    /// Parameter keys that must be set once all overlays are applied.
    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// `[pipeline.<id>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub category: Option<String>,

    /// `[[pipeline.<id>.node]]` entries, in declaration order.
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeDefinition>,

    /// `[[pipeline.<id>.edge]]` entries.
    #[serde(default, rename = "edge")]
    pub edges: Vec<EdgeDefinition>,
}

/// Engine knobs after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_run_duration: Duration,
    pub reaper_interval: Duration,
    pub subscriber_buffer: usize,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_run_duration: Duration::from_secs(60 * 60),
            reaper_interval: Duration::from_secs(30),
            subscriber_buffer: default_buffer(),
            event_buffer: default_buffer(),
        }
    }
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSettings,
    pub templates: InMemoryTemplateStore,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(engine: EngineSettings, templates: InMemoryTemplateStore) -> Self {
        Self { engine, templates }
    }
}
