// tests/runtime_fake_runner.rs

mod common;
use crate::common::{engine, init_tracing, start, state_of, store, task, with_timeout};

use std::error::Error;
use std::sync::Arc;

use tokio::sync::mpsc;

use pipeflow::dag::{PipelineState, TaskState};
use pipeflow::engine::{Runtime, RuntimeEvent, RuntimeOptions};
use pipeflow_test_utils::{FakeRunner, PipelineBuilder};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn runtime_drives_runs_to_completion_and_exits_when_idle() -> TestResult {
    init_tracing();

    let (tx, rx) = mpsc::channel::<RuntimeEvent>(64);
    let runner = Arc::new(FakeRunner::auto(tx).exit_code("x", 1));
    let pipeline = PipelineBuilder::new("guarded")
        .node("x")
        .node("h")
        .node("after")
        .on_failure("x", "h")
        .on_success("x", "after")
        .build();
    let engine = engine(store("alpha", &["x", "h", "after"], vec![pipeline]), runner.clone());

    let r1 = start(&engine, "guarded").await;
    let r2 = start(&engine, "guarded").await;

    let runtime = Runtime::new(
        engine.clone(),
        rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    with_timeout(runtime.run()).await?;

    // `after` sat on the required path and was skipped, so the handler
    // alone does not rescue the run.
    for run in [r1, r2] {
        assert_eq!(engine.run(run).await?.state, PipelineState::Failure);
        assert_eq!(state_of(&engine, run, "x").await, TaskState::Failure);
        assert_eq!(state_of(&engine, run, "h").await, TaskState::Success);
        assert_eq!(state_of(&engine, run, "after").await, TaskState::Skipped);
    }
    assert_eq!(runner.dispatched_nodes(), vec!["x", "h", "x", "h"]);

    // Runner log lines precede the engine's own exit entry.
    let x = task(&engine, r1, "x").await;
    let messages: Vec<String> = engine
        .read_logs(x.id, 0)?
        .into_iter()
        .map(|e| e.entry.message)
        .collect();
    assert_eq!(messages, vec!["running echo x", "exited with code 1"]);
    Ok(())
}

#[tokio::test]
async fn runtime_stops_on_shutdown_request() -> TestResult {
    init_tracing();

    let (tx, rx) = mpsc::channel::<RuntimeEvent>(8);
    let engine = engine(store("alpha", &["x"], vec![PipelineBuilder::new("p").node("x").build()]), Arc::new(FakeRunner::manual()));
    let run = start(&engine, "p").await;

    tx.send(RuntimeEvent::ShutdownRequested).await?;
    let runtime = Runtime::new(engine.clone(), rx, RuntimeOptions::default());
    with_timeout(runtime.run()).await?;

    // Nothing completed the task; the run is left running.
    assert_eq!(engine.run(run).await?.state, PipelineState::Running);
    Ok(())
}

#[cfg(unix)]
mod process_runner {
    use super::*;

    use std::time::Duration;

    use pipeflow::engine::Engine;
    use pipeflow::config::EngineSettings;
    use pipeflow::exec::ProcessRunner;
    use pipeflow::logs::LogLevel;
    use pipeflow::store::Persister;
    use pipeflow::template::InMemoryTemplateStore;
    use pipeflow_test_utils::TaskBuilder;

    fn process_engine(command: &str) -> (Engine, ProcessRunner, mpsc::Receiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let runner = ProcessRunner::new(tx);
        let templates = InMemoryTemplateStore::new()
            .with_task(
                TaskBuilder::new("x", "local")
                    .command(command)
                    .param("GREETING", "hello")
                    .build(),
            )
            .with_pipeline(PipelineBuilder::new("p").node("x").build());
        let engine = Engine::new(
            Arc::new(templates),
            Arc::new(runner.clone()),
            EngineSettings::default(),
            Persister::disabled(),
        );
        (engine, runner, rx)
    }

    #[tokio::test]
    async fn process_output_and_exit_code_reach_the_engine() -> TestResult {
        init_tracing();

        let (engine, _runner, rx) =
            process_engine("echo out; echo err 1>&2; echo \"$GREETING\"; exit 3");
        let run = start(&engine, "p").await;

        let runtime = Runtime::new(
            engine.clone(),
            rx,
            RuntimeOptions {
                exit_when_idle: true,
            },
        );
        with_timeout(runtime.run()).await?;

        assert_eq!(engine.run(run).await?.state, PipelineState::Failure);
        let x = task(&engine, run, "x").await;
        assert_eq!(x.state, TaskState::Failure);

        let logs = engine.read_logs(x.id, 0)?;
        let find = |msg: &str| logs.iter().find(|e| e.entry.message == msg).map(|e| e.entry.level);
        assert_eq!(find("out"), Some(LogLevel::Info));
        assert_eq!(find("hello"), Some(LogLevel::Info));
        assert_eq!(find("err"), Some(LogLevel::Warning));
        assert_eq!(
            logs.last().map(|e| e.entry.message.as_str()),
            Some("exited with code 3")
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_process_reports_no_completion() -> TestResult {
        init_tracing();

        let (engine, runner, mut rx) = process_engine("exec sleep 30");
        let run = start(&engine, "p").await;
        assert_eq!(runner.in_flight(), 1);

        assert!(engine.cancel_run(run).await?);
        assert_eq!(runner.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, RuntimeEvent::TaskCompleted { .. }),
                "cancelled task reported a completion: {event:?}"
            );
        }
        assert_eq!(engine.run(run).await?.state, PipelineState::Cancelled);
        Ok(())
    }
}
