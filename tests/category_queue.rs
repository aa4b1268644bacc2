// tests/category_queue.rs

mod common;
use crate::common::{complete, engine, init_tracing, start, store};

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use pipeflow::dag::PipelineState;
use pipeflow::errors::PipeflowError;
use pipeflow::template::InMemoryTemplateStore;
use pipeflow::types::TriggerKind;
use pipeflow_test_utils::{FakeRunner, PipelineBuilder, TaskBuilder};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn different_categories_run_in_parallel() -> TestResult {
    init_tracing();

    let templates = InMemoryTemplateStore::new()
        .with_task(TaskBuilder::new("a", "alpha").build())
        .with_task(TaskBuilder::new("b", "beta").build())
        .with_pipeline(PipelineBuilder::new("pa").node("a").build())
        .with_pipeline(PipelineBuilder::new("pb").node("b").build());
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(templates, runner.clone());

    let ra = start(&engine, "pa").await;
    let rb = start(&engine, "pb").await;

    assert_eq!(engine.run(ra).await?.state, PipelineState::Running);
    assert_eq!(engine.run(rb).await?.state, PipelineState::Running);
    assert_eq!(engine.queue_position(ra).await?, Some(0));
    assert_eq!(engine.queue_position(rb).await?, Some(0));
    assert_eq!(runner.dispatched_nodes(), vec!["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn pipeline_category_override_wins_over_task_category() -> TestResult {
    init_tracing();

    let templates = InMemoryTemplateStore::new()
        .with_task(TaskBuilder::new("a", "alpha").build())
        .with_pipeline(PipelineBuilder::new("plain").node("a").build())
        .with_pipeline(PipelineBuilder::new("moved").category("gamma").node("a").build());
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(templates, runner.clone());

    let r1 = start(&engine, "plain").await;
    let r2 = start(&engine, "moved").await;

    assert_eq!(engine.run(r1).await?.category, "alpha");
    assert_eq!(engine.run(r2).await?.category, "gamma");
    // Separate categories, so neither waits.
    assert_eq!(engine.queue_position(r2).await?, Some(0));
    Ok(())
}

#[tokio::test]
async fn cancelling_a_waiting_run_renumbers_the_queue() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(store("alpha", &["x"], vec![pipeline]), runner.clone());

    let r1 = start(&engine, "job").await;
    let r2 = start(&engine, "job").await;
    let r3 = start(&engine, "job").await;
    assert_eq!(engine.queue_position(r3).await?, Some(2));

    assert!(engine.cancel_run(r2).await?);

    assert_eq!(engine.run(r2).await?.state, PipelineState::Cancelled);
    assert_eq!(engine.queue_position(r2).await?, None);
    assert_eq!(engine.queue_position(r1).await?, Some(0));
    assert_eq!(engine.queue_position(r3).await?, Some(1));
    assert_eq!(engine.run(r3).await?.queue_position, Some(1));
    // The cancelled run never reached the runner.
    assert_eq!(runner.dispatched().len(), 1);
    assert!(runner.cancelled().is_empty());

    complete(&engine, r1, "x", 0).await?;
    assert_eq!(engine.run(r3).await?.state, PipelineState::Running);
    assert_eq!(engine.queue_position(r3).await?, Some(0));
    Ok(())
}

#[tokio::test]
async fn rejected_template_creates_nothing() -> TestResult {
    init_tracing();

    let templates = InMemoryTemplateStore::new()
        .with_task(TaskBuilder::new("deploy", "alpha").require("TARGET").build())
        .with_pipeline(PipelineBuilder::new("release").node("deploy").build());
    let runner = Arc::new(FakeRunner::manual());
    let engine = engine(templates, runner.clone());

    let err = engine
        .create_run("release", TriggerKind::Manual, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipeflowError::Validation(ref m) if m.contains("TARGET")));

    let err = engine
        .create_run("missing", TriggerKind::Scheduled, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipeflowError::UnknownPipeline(_)));

    assert!(engine.runs().await.is_empty());
    assert!(runner.dispatched().is_empty());
    assert!(engine.is_idle().await);

    // The same pipeline is accepted once the parameter is supplied.
    let overrides = BTreeMap::from([("TARGET".to_string(), "prod".to_string())]);
    let run = engine
        .create_run("release", TriggerKind::Manual, overrides)
        .await?;
    let dispatched = runner.last_dispatch_of("deploy").expect("deploy dispatched");
    assert_eq!(dispatched.task.run_id, run);
    assert_eq!(dispatched.task.parameters.get("TARGET").map(String::as_str), Some("prod"));
    Ok(())
}
