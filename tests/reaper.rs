// tests/reaper.rs

mod common;
use crate::common::{engine_with, init_tracing, start, store, task, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use pipeflow::config::EngineSettings;
use pipeflow::dag::PipelineState;
use pipeflow::engine::spawn_reaper;
use pipeflow_test_utils::{FakeRunner, PipelineBuilder};

type TestResult = Result<(), Box<dyn Error>>;

const PERIOD: Duration = Duration::from_millis(10);

#[tokio::test(start_paused = true)]
async fn background_sweep_reaps_overdue_run_and_stops_on_shutdown() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new("job").node("x").build();
    let runner = Arc::new(FakeRunner::manual());
    let settings = EngineSettings {
        max_run_duration: Duration::from_millis(1),
        reaper_interval: PERIOD,
        ..EngineSettings::default()
    };
    let engine = engine_with(store("alpha", &["x"], vec![pipeline]), runner.clone(), settings);

    let r1 = start(&engine, "job").await;
    let r2 = start(&engine, "job").await;
    let x1 = task(&engine, r1, "x").await;
    assert_eq!(engine.queue_position(r2).await?, Some(1));

    // Run age is measured on the wall clock, which a paused runtime does
    // not move.
    std::thread::sleep(Duration::from_millis(5));

    let reaper = spawn_reaper(engine.clone(), PERIOD);
    tokio::task::yield_now().await;
    tokio::time::advance(PERIOD * 2).await;

    with_timeout(async {
        loop {
            if engine.run(r1).await?.state == PipelineState::Cancelled {
                return Ok::<_, pipeflow::errors::PipeflowError>(());
            }
            tokio::time::sleep(PERIOD / 2).await;
        }
    })
    .await?;

    assert_eq!(runner.cancelled().first(), x1.correlation_id.as_ref());
    // The freed slot went to the waiting run.
    assert_eq!(runner.dispatched_nodes(), vec!["x", "x"]);
    assert_eq!(engine.queue_position(r1).await?, None);

    with_timeout(reaper.shutdown()).await;

    // No sweeps after shutdown.
    let settled = engine.run(r2).await?.state;
    let cancels = runner.cancelled().len();
    tokio::time::advance(PERIOD * 10).await;
    tokio::task::yield_now().await;
    assert_eq!(engine.run(r2).await?.state, settled);
    assert_eq!(runner.cancelled().len(), cancels);
    Ok(())
}
