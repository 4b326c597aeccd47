//! Cleanup cycle: orphan recovery and retry promotion.
//!
//! Only the database is trusted here; a master restart re-detects live jobs
//! as not-yet-orphans and leaves them alone while their workers heartbeat.

use std::time::Duration;

use tracing::{info, warn};

use transcode_core::error::ApiError;

use crate::metrics::Metrics;
use crate::store::Store;

const RETRY_PROMOTION_BATCH: i64 = 64;

pub async fn run_cycle(
    store: &Store,
    metrics: &Metrics,
    worker_timeout: Duration,
) -> Result<(), ApiError> {
    // Jobs whose worker stopped heartbeating (or was marked offline).
    let orphans = store.get_orphaned_jobs(worker_timeout).await?;
    for job in orphans {
        let worker = job
            .node_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let reason = format!("worker {worker} died");

        match store.recover_orphan(job.id, &reason).await {
            Ok(Some(status)) => {
                metrics.orphans_recovered.inc();
                info!(job_id = %job.id, worker = %worker, final_status = %status, "orphan recovered");
            }
            Ok(None) => {} // no longer assigned/running, nothing to do
            Err(e) => warn!(job_id = %job.id, error = %e, "orphan recovery failed"),
        }
    }

    // Retrying jobs whose backoff elapsed go back to the queue.
    let promoted = store.promote_due_retries(RETRY_PROMOTION_BATCH).await?;
    for job in &promoted {
        metrics.retries_scheduled.inc();
        info!(job_id = %job.id, retry_count = job.retry_count, "retry promoted to queue");
    }

    // Safety net; normally exhaustion is settled when the failure is recorded.
    let exhausted = store.fail_exhausted_retries().await?;
    if exhausted > 0 {
        warn!(count = exhausted, "retrying jobs failed after exhausting their budget");
    }

    Ok(())
}
