#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use pipeflow::config::EngineSettings;
use pipeflow::dag::{TaskRun, TaskState};
use pipeflow::engine::{Engine, RunEvent, RunnerOutcome};
use pipeflow::errors::Result;
use pipeflow::store::Persister;
use pipeflow::template::{InMemoryTemplateStore, PipelineDefinition};
use pipeflow::types::{RunId, TriggerKind};
use pipeflow_test_utils::{FakeRunner, TaskBuilder};

pub use pipeflow_test_utils::{init_tracing, with_timeout};

/// Template store with one task per id, all in `category`, plus `pipelines`.
pub fn store(category: &str, tasks: &[&str], pipelines: Vec<PipelineDefinition>) -> InMemoryTemplateStore {
    let mut store = InMemoryTemplateStore::new();
    for id in tasks {
        store.insert_task(TaskBuilder::new(id, category).build());
    }
    for p in pipelines {
        store.insert_pipeline(p);
    }
    store
}

pub fn engine(store: InMemoryTemplateStore, runner: Arc<FakeRunner>) -> Engine {
    engine_with(store, runner, EngineSettings::default())
}

pub fn engine_with(
    store: InMemoryTemplateStore,
    runner: Arc<FakeRunner>,
    settings: EngineSettings,
) -> Engine {
    Engine::new(Arc::new(store), runner, settings, Persister::disabled())
}

pub async fn start(engine: &Engine, pipeline: &str) -> RunId {
    engine
        .create_run(pipeline, TriggerKind::Manual, BTreeMap::new())
        .await
        .expect("run should be created")
}

pub async fn task(engine: &Engine, run: RunId, node: &str) -> TaskRun {
    engine
        .task_runs(run)
        .await
        .expect("run exists")
        .into_iter()
        .find(|t| t.node == node)
        .unwrap_or_else(|| panic!("run has no node '{node}'"))
}

pub async fn state_of(engine: &Engine, run: RunId, node: &str) -> TaskState {
    task(engine, run, node).await.state
}

/// Report an exit code for the current dispatch of `node` in `run`.
pub async fn complete(engine: &Engine, run: RunId, node: &str, code: i32) -> Result<()> {
    let t = task(engine, run, node).await;
    let correlation = t.correlation_id.expect("task was dispatched");
    engine
        .handle_completion(correlation, t.id, RunnerOutcome::Exited(code))
        .await
}

/// Everything currently buffered on an event receiver.
pub fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// Successive states reported for `node` of `run`.
pub fn task_states(events: &[RunEvent], run: RunId, node: &str) -> Vec<TaskState> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskStateChanged {
                run_id,
                node: n,
                state,
                ..
            } if *run_id == run && n == node => Some(*state),
            _ => None,
        })
        .collect()
}
