// tests/log_streaming.rs

mod common;
use crate::common::{complete, engine, engine_with, init_tracing, start, store, task, with_timeout};

use std::error::Error;
use std::sync::Arc;

use pipeflow::config::EngineSettings;
use pipeflow::logs::{LogEntry, LogEvent, LogLevel};
use pipeflow_test_utils::{FakeRunner, PipelineBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn message(event: Option<LogEvent>) -> String {
    match event {
        Some(LogEvent::Entry(e)) => e.entry.message,
        other => panic!("expected a log entry, got {other:?}"),
    }
}

#[tokio::test]
async fn subscriber_follows_live_lines_until_task_ends() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let engine = engine(store("alpha", &["x"], vec![pipeline]), Arc::new(FakeRunner::manual()));

    let run = start(&engine, "job").await;
    let x = task(&engine, run, "x").await;
    let mut sub = engine.subscribe(x.id)?;

    assert_eq!(engine.handle_log_line(x.id, LogEntry::info("compiling")).await?, 0);
    engine.handle_log_line(x.id, LogEntry::new(LogLevel::Warning, "slow disk")).await?;
    complete(&engine, run, "x", 0).await?;

    with_timeout(async {
        assert_eq!(message(sub.next().await), "compiling");
        assert_eq!(message(sub.next().await), "slow disk");
        assert_eq!(sub.next().await, None);
    })
    .await;
    assert!(sub.is_finished());

    // History stays readable after the stream closed.
    let history = engine.read_logs(x.id, 1)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].seq, 1);
    assert_eq!(history[0].entry.level, LogLevel::Warning);
    Ok(())
}

#[tokio::test]
async fn subscribe_from_replays_then_follows() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let engine = engine(store("alpha", &["x"], vec![pipeline]), Arc::new(FakeRunner::manual()));

    let run = start(&engine, "job").await;
    let x = task(&engine, run, "x").await;
    for line in ["one", "two", "three"] {
        engine.handle_log_line(x.id, LogEntry::info(line)).await?;
    }

    let mut sub = engine.subscribe_from(x.id, 1)?;
    engine.handle_log_line(x.id, LogEntry::info("four")).await?;

    with_timeout(async {
        assert_eq!(message(sub.next().await), "two");
        assert_eq!(message(sub.next().await), "three");
        assert_eq!(message(sub.next().await), "four");
    })
    .await;
    Ok(())
}

#[tokio::test]
async fn slow_subscriber_sees_a_gap_and_does_not_block_appends() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let settings = EngineSettings {
        subscriber_buffer: 2,
        ..EngineSettings::default()
    };
    let engine = engine_with(
        store("alpha", &["x"], vec![pipeline]),
        Arc::new(FakeRunner::manual()),
        settings,
    );

    let run = start(&engine, "job").await;
    let x = task(&engine, run, "x").await;
    let mut slow = engine.subscribe(x.id)?;

    for i in 0..5 {
        engine.handle_log_line(x.id, LogEntry::info(i.to_string())).await?;
    }

    assert_eq!(slow.try_next(), Some(LogEvent::Gap { missed: 3 }));
    assert_eq!(message(slow.try_next()), "3");
    assert_eq!(message(slow.try_next()), "4");
    assert_eq!(engine.read_logs(x.id, 0)?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn late_subscriber_on_finished_task_gets_history_only() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let engine = engine(store("alpha", &["x"], vec![pipeline]), Arc::new(FakeRunner::manual()));

    let run = start(&engine, "job").await;
    let x = task(&engine, run, "x").await;
    engine.handle_log_line(x.id, LogEntry::info("done")).await?;
    complete(&engine, run, "x", 4).await?;

    let mut sub = engine.subscribe_from(x.id, 0)?;
    let mut seen = Vec::new();
    with_timeout(async {
        while let Some(event) = sub.next().await {
            seen.push(message(Some(event)));
        }
    })
    .await;
    assert_eq!(seen, vec!["done", "exited with code 4"]);
    Ok(())
}
