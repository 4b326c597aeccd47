//! Assignment cycle: match the backlog against available workers.

use chrono::Utc;
use tracing::{debug, warn};

use transcode_core::error::ApiError;
use transcode_core::fsm::effective_priority;
use transcode_core::job::Job;

use crate::metrics::Metrics;
use crate::store::Store;

/// One assignment pass. Pulls a backlog window, orders it by effective
/// priority (queue class > priority + aging, FIFO on ties), and binds each
/// job to the least-recently-assigned eligible worker. Conflicts are skipped;
/// the batch size bounds cycle latency.
pub async fn run_cycle(store: &Store, metrics: &Metrics, batch_size: i64) -> Result<(), ApiError> {
    metrics.queue_depth.set(store.queue_depth().await?);

    // Window wider than the batch so aged jobs deep in FIFO order surface.
    let mut candidates = store.get_assignment_candidates(batch_size * 4).await?;
    if candidates.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    candidates.sort_by(|a, b| {
        score(b, now)
            .cmp(&score(a, now))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    let mut assigned = 0;
    for job in candidates {
        if assigned >= batch_size {
            break;
        }

        let nodes = store
            .get_available_nodes(job.tenant_id, &job.required_capabilities)
            .await?;
        let Some(node) = nodes.first() else {
            continue;
        };

        metrics.assignment_attempts.inc();
        match store.assign_job_to_worker(job.id, node.id).await {
            Ok(true) => {
                assigned += 1;
                metrics.assignments.inc();
                debug!(job_id = %job.id, node_id = %node.id, "job assigned");
            }
            Ok(false) => {
                // Someone else claimed the job or the worker; move on.
                metrics.assignment_failures.inc();
            }
            Err(ApiError::AssignmentConflict { job_id }) => {
                metrics.assignment_failures.inc();
                debug!(job_id = %job_id, "assignment conflict, skipping");
            }
            Err(e) => {
                metrics.assignment_failures.inc();
                warn!(job_id = %job.id, error = %e, "assignment attempt failed");
            }
        }
    }

    Ok(())
}

fn score(job: &Job, now: chrono::DateTime<Utc>) -> i64 {
    let age = now
        .signed_duration_since(job.created_at)
        .to_std()
        .unwrap_or_default();
    effective_priority(job.queue, job.priority, age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;
    use transcode_core::job::{JobPriority, QueueClass};
    use uuid::Uuid;

    fn job(queue: QueueClass, priority: JobPriority, age_mins: i64) -> Job {
        Job::builder()
            .tenant_id(Uuid::new_v4())
            .scenario("1080p30-h264")
            .queue(queue)
            .priority(priority)
            .created_at(Utc::now() - chrono::Duration::minutes(age_mins))
            .parameters(Json(serde_json::json!({})))
            .build()
    }

    fn sorted_ids(mut jobs: Vec<Job>) -> Vec<Uuid> {
        let now = Utc::now();
        jobs.sort_by(|a, b| {
            score(b, now)
                .cmp(&score(a, now))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        jobs.into_iter().map(|j| j.id).collect()
    }

    #[test]
    fn live_queue_outranks_default() {
        let live = job(QueueClass::Live, JobPriority::Low, 0);
        let default = job(QueueClass::Default, JobPriority::High, 0);
        let order = sorted_ids(vec![default.clone(), live.clone()]);
        assert_eq!(order, vec![live.id, default.id]);
    }

    #[test]
    fn fresh_high_beats_fresh_low_in_same_queue() {
        let high = job(QueueClass::Default, JobPriority::High, 0);
        let low = job(QueueClass::Default, JobPriority::Low, 0);
        let order = sorted_ids(vec![low.clone(), high.clone()]);
        assert_eq!(order, vec![high.id, low.id]);
    }

    #[test]
    fn aged_low_overtakes_fresh_high() {
        let aged_low = job(QueueClass::Default, JobPriority::Low, 31);
        let fresh_high = job(QueueClass::Default, JobPriority::High, 0);
        let order = sorted_ids(vec![fresh_high.clone(), aged_low.clone()]);
        assert_eq!(order, vec![aged_low.id, fresh_high.id]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let older = job(QueueClass::Default, JobPriority::Medium, 2);
        let newer = job(QueueClass::Default, JobPriority::Medium, 1);
        let order = sorted_ids(vec![newer.clone(), older.clone()]);
        assert_eq!(order, vec![older.id, newer.id]);
    }
}
