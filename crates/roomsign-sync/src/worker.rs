//! # Worker Loop
//!
//! Drives [`DispatchJob::dispatch`] on a fixed cadence.
//!
//! ```text
//! t=0          t=30s        t=60s
//!  │ dispatch   │ dispatch   │ dispatch   ...   shutdown ─► finish cycle, stop
//! ```
//!
//! The first cycle runs on startup. A failed cycle is logged and the loop
//! waits for the next tick; missed ticks are delayed, never bursted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::dispatcher::DispatchJob;
use crate::error::{SyncError, SyncResult};

/// Periodic dispatch loop.
pub struct WorkerLoop {
    job: Arc<dyn DispatchJob>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a [`WorkerLoop`].
#[derive(Clone)]
pub struct WorkerLoopHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl WorkerLoopHandle {
    /// Asks the loop to stop after its current cycle.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Worker shutdown channel closed".into()))
    }
}

impl WorkerLoop {
    pub fn new(job: Arc<dyn DispatchJob>, interval: Duration) -> (Self, WorkerLoopHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = WorkerLoop {
            job,
            interval,
            shutdown_rx,
        };
        (worker, WorkerLoopHandle { shutdown_tx })
    }

    /// Runs until shut down. Spawn it or await it from `main`.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Sync worker starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.job.dispatch().await {
                        Ok(report) if report.selected > 0 || report.recovered > 0 => {
                            info!(
                                recovered = report.recovered,
                                selected = report.selected,
                                failed = report.failed,
                                "Sync cycle finished"
                            );
                        }
                        Ok(_) => debug!("Sync cycle idle"),
                        Err(e) => error!(?e, retryable = e.is_retryable(), "Sync cycle failed"),
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync worker shutting down");
                    break;
                }
            }
        }

        info!("Sync worker stopped");
    }
}
