//! The master's three scheduler loops: assignment, health check, cleanup.
//!
//! The loops are independent tasks on fixed tickers and share no state; all
//! coordination goes through the store. Shutdown is cooperative: each loop
//! finishes its in-flight cycle before exiting.

mod assign;
mod cleanup;
mod health;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use transcode_core::config::SchedulerConfig;

use crate::metrics::Metrics;
use crate::store::Store;

pub struct Scheduler {
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, metrics: Arc<Metrics>, config: SchedulerConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Spawn all three loops. Each gets a child of `shutdown` so they can be
    /// stopped together; the returned handles resolve once the loops drain.
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            assignment_interval_secs = self.config.assignment_interval.as_secs(),
            health_interval_secs = self.config.health_interval.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "scheduler starting"
        );

        vec![
            tokio::spawn(Self::run_assignment_loop(self.clone(), shutdown.child_token())),
            tokio::spawn(Self::run_health_loop(self.clone(), shutdown.child_token())),
            tokio::spawn(Self::run_cleanup_loop(self, shutdown.child_token())),
        ]
    }

    async fn run_assignment_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.assignment_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = assign::run_cycle(
                        &self.store,
                        &self.metrics,
                        self.config.assignment_batch_size,
                    )
                    .await
                    {
                        error!(error = %e, "assignment cycle failed");
                    }
                }
            }
        }
        info!("assignment loop stopped");
    }

    async fn run_health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = health::run_cycle(
                        &self.store,
                        &self.metrics,
                        self.config.worker_timeout,
                    )
                    .await
                    {
                        error!(error = %e, "health cycle failed");
                    }
                }
            }
        }
        info!("health loop stopped");
    }

    async fn run_cleanup_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = cleanup::run_cycle(
                        &self.store,
                        &self.metrics,
                        self.config.worker_timeout,
                    )
                    .await
                    {
                        error!(error = %e, "cleanup cycle failed");
                    }
                }
            }
        }
        info!("cleanup loop stopped");
    }
}
