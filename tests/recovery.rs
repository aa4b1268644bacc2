// tests/recovery.rs

mod common;
use crate::common::{init_tracing, start, state_of, store, task};

use std::error::Error;
use std::sync::Arc;

use pipeflow::config::EngineSettings;
use pipeflow::dag::{PipelineState, TaskState};
use pipeflow::engine::{Engine, RunnerOutcome};
use pipeflow::logs::LogEntry;
use pipeflow::store::{InMemoryRunStore, Persister, RunStore};
use pipeflow::template::InMemoryTemplateStore;
use pipeflow_test_utils::{FakeRunner, PipelineBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn templates() -> InMemoryTemplateStore {
    let pipeline = PipelineBuilder::new("guarded")
        .node("x")
        .node("h")
        .on_failure("x", "h")
        .build();
    store("alpha", &["x", "h"], vec![pipeline])
}

#[tokio::test]
async fn restart_fails_lost_tasks_and_resumes_the_queue() -> TestResult {
    init_tracing();

    let backing = Arc::new(InMemoryRunStore::new());

    // First process: r1 is executing x, r2 waits behind it.
    let (r1, r2, x1) = {
        let engine = Engine::new(
            Arc::new(templates()),
            Arc::new(FakeRunner::manual()),
            EngineSettings::default(),
            Persister::spawn(backing.clone()),
        );
        let r1 = start(&engine, "guarded").await;
        let r2 = start(&engine, "guarded").await;
        let x1 = task(&engine, r1, "x").await;
        engine.handle_log_line(x1.id, LogEntry::info("halfway")).await?;
        engine.flush().await;
        (r1, r2, x1)
    };

    let snapshot = backing.load_snapshot().await?;
    assert_eq!(snapshot.runs.len(), 2);

    // Second process.
    let runner = Arc::new(FakeRunner::manual());
    let engine = Engine::new(
        Arc::new(templates()),
        runner.clone(),
        EngineSettings::default(),
        Persister::disabled(),
    );
    let report = engine.recover(snapshot).await?;

    assert_eq!(report.runs, 2);
    assert_eq!(report.lost_tasks, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.superseded, 0);

    // x was lost, so its failure handler runs on the new runner.
    assert_eq!(state_of(&engine, r1, "x").await, TaskState::Error);
    assert_eq!(state_of(&engine, r1, "h").await, TaskState::Running);
    assert_eq!(runner.dispatched_nodes(), vec!["h"]);

    let logs = engine.read_logs(x1.id, 0)?;
    let messages: Vec<_> = logs.iter().map(|e| e.entry.message.as_str()).collect();
    assert_eq!(messages, vec!["halfway", "task lost on restart"]);

    assert_eq!(engine.run(r2).await?.state, PipelineState::Pending);
    assert_eq!(engine.queue_position(r2).await?, Some(1));

    let h = task(&engine, r1, "h").await;
    engine
        .handle_completion(h.correlation_id.unwrap(), h.id, RunnerOutcome::Exited(0))
        .await?;

    assert_eq!(engine.run(r1).await?.state, PipelineState::Success);
    assert_eq!(engine.run(r2).await?.state, PipelineState::Running);
    assert_eq!(runner.last_dispatch_of("x").map(|d| d.task.run_id), Some(r2));
    Ok(())
}

#[tokio::test]
async fn recovering_the_same_snapshot_twice_changes_nothing() -> TestResult {
    init_tracing();

    let backing = Arc::new(InMemoryRunStore::new());
    let engine = Engine::new(
        Arc::new(templates()),
        Arc::new(FakeRunner::manual()),
        EngineSettings::default(),
        Persister::spawn(backing.clone()),
    );
    let run = start(&engine, "guarded").await;
    engine.flush().await;

    let snapshot = backing.load_snapshot().await?;
    let report = engine.recover(snapshot).await?;
    assert_eq!(report.runs, 0);
    assert_eq!(state_of(&engine, run, "x").await, TaskState::Running);
    Ok(())
}
