// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod logs;
pub mod store;
pub mod template;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::dag::{PipelineState, TaskState};
use crate::engine::{spawn_reaper, Engine, RunEvent, Runtime, RuntimeEvent, RuntimeOptions};
use crate::exec::ProcessRunner;
use crate::logs::LogEvent;
use crate::store::{InMemoryRunStore, Persister};
use crate::template::TemplateStore;
use crate::types::TriggerKind;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - engine, process runner and store
/// - runtime loop and reaper
/// - log following on stdout
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let settings = cfg.engine;
    let overrides: BTreeMap<String, String> = args.params.iter().cloned().collect();

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(settings.event_buffer);

    let runner = Arc::new(ProcessRunner::new(rt_tx.clone()));
    let store = Arc::new(InMemoryRunStore::new());
    let persister = Persister::spawn(store);
    let templates: Arc<dyn TemplateStore> = Arc::new(cfg.templates);
    let engine = Engine::new(templates, runner, settings, persister);

    // Ctrl-C -> graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let follower = LogFollower::spawn(engine.clone());
    let reaper = spawn_reaper(engine.clone(), settings.reaper_interval);

    let mut created = Vec::with_capacity(args.runs.len());
    for pipeline in &args.runs {
        let run_id = engine
            .create_run(pipeline, TriggerKind::Manual, overrides.clone())
            .await?;
        info!(run_id = %run_id, %pipeline, "triggered pipeline run");
        created.push(run_id);
    }

    let options = RuntimeOptions {
        exit_when_idle: args.once,
    };
    Runtime::new(engine.clone(), rt_rx, options).run().await?;

    reaper.shutdown().await;
    follower.shutdown().await;
    engine.flush().await;

    let mut unsuccessful = 0;
    for run_id in created {
        let run = engine.run(run_id).await?;
        println!("run {} ({}): {}", run.id, run.pipeline, run.state);
        if run.state.is_terminal() && run.state != PipelineState::Success {
            unsuccessful += 1;
        }
    }

    if args.once && unsuccessful > 0 {
        bail!("{unsuccessful} pipeline run(s) did not succeed");
    }
    Ok(())
}

/// Prints every task's log lines to stdout as `[node] message`.
struct LogFollower {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl LogFollower {
    fn spawn(engine: Engine) -> Self {
        let mut events = engine.events();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut printers: Vec<JoinHandle<()>> = Vec::new();

            loop {
                tokio::select! {
                    ev = events.recv() => match ev {
                        Ok(RunEvent::TaskStateChanged { task_run_id, node, state: TaskState::Running, .. }) => {
                            match engine.subscribe_from(task_run_id, 0) {
                                Ok(mut sub) => printers.push(tokio::spawn(async move {
                                    while let Some(event) = sub.next().await {
                                        match event {
                                            LogEvent::Entry(e) => println!("[{node}] {}", e.entry.message),
                                            LogEvent::Gap { missed } => println!("[{node}] ... {missed} line(s) dropped"),
                                        }
                                    }
                                })),
                                Err(err) => debug!(error = %err, "cannot follow task log"),
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "log follower lagged behind run events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }

            for printer in printers {
                if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
                    debug!("log printer still busy at shutdown");
                }
            }
        });

        Self { shutdown_tx, join }
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Simple dry-run output: engine settings, tasks and pipelines.
fn print_dry_run(cfg: &ConfigFile) {
    println!("pipeflow dry-run");
    println!("  engine.max_run_duration = {:?}", cfg.engine.max_run_duration);
    println!("  engine.reaper_interval = {:?}", cfg.engine.reaper_interval);
    println!("  engine.subscriber_buffer = {}", cfg.engine.subscriber_buffer);
    println!();

    let tasks = cfg.templates.tasks();
    println!("tasks ({}):", tasks.len());
    for task in tasks {
        println!("  - {} [{}]", task.id, task.category);
        println!("      command: {}", task.command);
        if !task.required.is_empty() {
            println!("      required: {:?}", task.required);
        }
        if !task.params.is_empty() {
            println!("      params: {:?}", task.params);
        }
    }
    println!();

    let pipelines = cfg.templates.pipelines();
    println!("pipelines ({}):", pipelines.len());
    for pipeline in pipelines {
        match &pipeline.category {
            Some(category) => println!("  - {} [{}]", pipeline.id, category),
            None => println!("  - {}", pipeline.id),
        }
        for node in &pipeline.nodes {
            println!("      node {} -> task {}", node.id, node.task);
        }
        for edge in &pipeline.edges {
            println!("      edge {} -> {} on {}", edge.from, edge.to, edge.on);
        }
    }

    debug!("dry-run complete (no execution)");
}
