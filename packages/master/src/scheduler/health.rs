//! Health cycle: worker liveness and job deadlines.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use transcode_core::error::ApiError;

use crate::metrics::Metrics;
use crate::store::Store;

pub async fn run_cycle(
    store: &Store,
    metrics: &Metrics,
    worker_timeout: Duration,
) -> Result<(), ApiError> {
    let offline = store.mark_stale_nodes_offline(worker_timeout).await?;
    for node_id in &offline {
        metrics.workers_marked_offline.inc();
        info!(node_id = %node_id, timeout_secs = worker_timeout.as_secs(), "worker marked offline");
    }

    let overdue = store.get_timed_out_jobs(Utc::now()).await?;
    for job in overdue {
        match store.time_out_job(job.id).await {
            Ok(Some(final_status)) => {
                metrics.timeouts_detected.inc();
                info!(job_id = %job.id, final_status = %final_status, "job timed out");
            }
            Ok(None) => {} // transitioned away before we got the lock
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to time out job"),
        }
    }

    Ok(())
}
