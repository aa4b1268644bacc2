// src/engine/reaper.rs

//! Periodic stale-run sweep.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::core::Engine;

/// Running reaper task. Dropping the handle does not stop it; call
/// [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Every `period`, cancel runs over their time budget and reconcile the
/// category queues.
pub fn spawn_reaper(engine: Engine, period: Duration) -> ReaperHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = engine.reap_stale(Utc::now()).await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "reaper cancelled stale runs");
                    }
                    let changed = engine.reconcile().await;
                    if changed > 0 {
                        info!(categories = changed, "reconciliation promoted runs");
                    }
                }
                _ = &mut shutdown_rx => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    });

    ReaperHandle {
        shutdown_tx: Some(shutdown_tx),
        join,
    }
}
