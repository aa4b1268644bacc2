// tests/cancel_behaviour.rs

mod common;
use crate::common::{complete, engine, init_tracing, start, state_of, store, task};

use std::error::Error;
use std::sync::Arc;

use pipeflow::dag::{PipelineState, TaskState};
use pipeflow::engine::RunnerOutcome;
use pipeflow::errors::PipeflowError;
use pipeflow::types::{CorrelationId, RunId};
use pipeflow_test_utils::{FakeRunner, PipelineBuilder};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn cancelling_active_run_cancels_live_tasks_and_the_process() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("xy").node("x").node("y").on_success("x", "y").build();
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(store("alpha", &["x", "y"], vec![pipeline]), runner.clone());

    let run = start(&engine, "xy").await;
    let x = task(&engine, run, "x").await;

    assert!(engine.cancel_run(run).await?);

    assert_eq!(engine.run(run).await?.state, PipelineState::Cancelled);
    assert_eq!(state_of(&engine, run, "x").await, TaskState::Cancelled);
    assert_eq!(state_of(&engine, run, "y").await, TaskState::Cancelled);
    assert_eq!(runner.cancelled(), vec![x.correlation_id.clone().unwrap()]);
    assert!(!engine.logs().is_open(x.id));

    // A late exit from the killed process is rejected and changes nothing.
    let err = complete(&engine, run, "x", 0).await.unwrap_err();
    assert!(matches!(err, PipeflowError::DuplicateTransition { .. }));
    assert_eq!(engine.run(run).await?.state, PipelineState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn cancelling_a_terminal_run_is_a_no_op() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(store("alpha", &["x"], vec![pipeline]), runner.clone());

    let run = start(&engine, "job").await;
    complete(&engine, run, "x", 0).await?;
    let finished = engine.run(run).await?;

    assert!(!engine.cancel_run(run).await?);
    let after = engine.run(run).await?;
    assert_eq!(after.state, PipelineState::Success);
    assert_eq!(after.completed_at, finished.completed_at);
    assert!(runner.cancelled().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelling_an_unknown_run_is_not_found() {
    init_tracing();

    let engine = engine(store("alpha", &[], vec![]), Arc::new(FakeRunner::manual()));
    let err = engine.cancel_run(RunId::new()).await.unwrap_err();
    assert!(matches!(err, PipeflowError::RunNotFound(_)));
}

#[tokio::test]
async fn completion_with_stale_correlation_is_rejected() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(store("alpha", &["x"], vec![pipeline]), runner.clone());

    let run = start(&engine, "job").await;
    let x = task(&engine, run, "x").await;

    let err = engine
        .handle_completion(CorrelationId::from("someone-else"), x.id, RunnerOutcome::Exited(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipeflowError::StaleCompletion { .. }));
    assert_eq!(state_of(&engine, run, "x").await, TaskState::Running);
    assert_eq!(engine.run(run).await?.state, PipelineState::Running);
    Ok(())
}

#[tokio::test]
async fn duplicate_completion_keeps_the_first_outcome() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(store("alpha", &["x"], vec![pipeline]), runner.clone());

    let run = start(&engine, "job").await;
    complete(&engine, run, "x", 0).await?;

    let err = complete(&engine, run, "x", 1).await.unwrap_err();
    assert!(matches!(
        err,
        PipeflowError::DuplicateTransition { state: TaskState::Success, .. }
    ));
    assert_eq!(state_of(&engine, run, "x").await, TaskState::Success);
    assert_eq!(engine.run(run).await?.state, PipelineState::Success);
    Ok(())
}
