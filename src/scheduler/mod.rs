//! Periodic source runs
//!
//! Every registered source with an `interval` gets its own task that issues a
//! [`RunRequest::Resume`] on that cadence. Sources run concurrently with each
//! other; runs of one source never overlap because each task awaits its run
//! before waiting for the next tick. A failed run is logged and retried on the
//! next tick.
//!
//! # Example
//!
//! ```no_run
//! use audit_sync::config::Config;
//! use audit_sync::engine::{SyncContext, SyncEngine};
//! use audit_sync::registry::SourceRegistry;
//! use audit_sync::scheduler::Scheduler;
//! use audit_sync::types::TimeUnit;
//! use std::sync::Arc;
//!
//! # async fn example() -> audit_sync::Result<()> {
//! let config = Config::load(std::path::Path::new("sync.json")).await?;
//! let context = SyncContext::connect(config).await?;
//! let engine = Arc::new(SyncEngine::new(context, SourceRegistry::new()));
//!
//! // Blocks until SIGTERM or SIGINT
//! Scheduler::new(engine, TimeUnit::Minutes).run_until_signal().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{RunRequest, SyncEngine};
use crate::types::{SourceId, TimeUnit};

/// Drives scheduled runs of every source that has an interval
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    unit: TimeUnit,
}

impl Scheduler {
    /// Create a scheduler; `unit` sets the continuation delta of simple sources
    pub fn new(engine: Arc<SyncEngine>, unit: TimeUnit) -> Self {
        Self { engine, unit }
    }

    /// Sources that will be run, with their intervals, in id order
    pub fn scheduled(&self) -> Vec<(SourceId, Duration)> {
        self.engine
            .registry()
            .iter()
            .filter_map(|source| {
                source
                    .config
                    .interval
                    .filter(|interval| !interval.is_zero())
                    .map(|interval| (source.config.id.clone(), interval))
            })
            .collect()
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped
    ///
    /// A run that is in flight when shutdown is requested is finished first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let scheduled = self.scheduled();
        if scheduled.is_empty() {
            info!("No sources with an interval, scheduler idle");
            return;
        }
        info!(sources = scheduled.len(), "Scheduler started");

        let tasks: Vec<_> = scheduled
            .into_iter()
            .map(|(id, interval)| {
                tokio::spawn(run_source(
                    self.engine.clone(),
                    id,
                    interval,
                    self.unit,
                    shutdown.clone(),
                ))
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Scheduled source task panicked");
            }
        }
        info!("Scheduler stopped");
    }

    /// Run until SIGTERM or SIGINT (Ctrl+C on non-unix platforms)
    pub async fn run_until_signal(self) {
        let (tx, rx) = watch::channel(false);
        let scheduler = tokio::spawn(self.run(rx));

        crate::wait_for_signal().await;
        info!("Shutting down scheduler");
        // Receivers only go away once the scheduler has already stopped
        let _ = tx.send(true);

        if let Err(e) = scheduler.await {
            warn!(error = %e, "Scheduler task panicked");
        }
    }
}

async fn run_source(
    engine: Arc<SyncEngine>,
    id: SourceId,
    interval: Duration,
    unit: TimeUnit,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(source = %id, interval_secs = interval.as_secs_f64(), "Source scheduled");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match engine.run(&id, RunRequest::Resume { unit }).await {
            Ok(report) => debug!(
                source = %id,
                delivered = report.delivered,
                state = %report.state,
                "Scheduled run finished"
            ),
            Err(e) => warn!(
                source = %id,
                error = %e,
                "Scheduled run failed, retrying on next tick"
            ),
        }
    }

    debug!(source = %id, "Source task stopped");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
