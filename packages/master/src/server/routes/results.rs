//! Result ingestion: the worker's final report drives the terminal FSM
//! transition. Idempotent: re-reporting a settled job is a no-op success.

use axum::extract::{Extension, State};
use axum::Json;
use tracing::info;

use transcode_core::error::ApiError;
use transcode_core::job::{FailureClass, Job, JobStatus};
use transcode_core::protocol::ResultReport;

use crate::server::app::AppState;
use crate::server::error::AppError;
use crate::server::middleware::{require_tenant, AuthContext};

/// POST /results
pub async fn report_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(report): Json<ResultReport>,
) -> Result<Json<Job>, AppError> {
    let tenant = require_tenant(&auth)?;
    let job_id = report.result.job_id;

    let job = state.store.get_job(job_id).await?;
    if job.tenant_id != tenant.id {
        return Err(AppError(ApiError::NotFound(format!("job {job_id}"))));
    }

    state.metrics.results_reported.inc();

    // The job may have settled while the encoder ran (canceled by an
    // operator, timed out and recovered). The late report is acknowledged
    // and discarded; the persisted terminal state stands.
    if job.status.is_terminal() {
        return Ok(Json(job));
    }

    // A report implies execution happened even if the start notification was
    // lost (or the job sat paused); bring the walk up to running before
    // settling it.
    if matches!(job.status, JobStatus::Assigned | JobStatus::Paused) {
        state
            .store
            .transition_job_state(job_id, JobStatus::Running, "result received")
            .await?;
    }

    if report.result.workload_succeeded() {
        let changed = state
            .store
            .complete_job(
                job_id,
                JobStatus::Completed,
                "encoder exited cleanly",
                Some(&report.result),
            )
            .await?;
        if changed {
            state.metrics.jobs_completed.inc();
        }
        info!(job_id = %job_id, node_id = %report.node_id, "job completed");
    } else {
        let class = report
            .failure_classification
            .unwrap_or(FailureClass::RuntimeError);
        let reason = report.failure_reason.clone().unwrap_or_else(|| {
            match report.result.exit_code {
                Some(code) => format!("encoder exited with code {code}"),
                None => "encoder terminated without an exit code".to_string(),
            }
        });

        let final_status = state
            .store
            .record_failure(job_id, &reason, class, Some(&report.result))
            .await?;
        if final_status == JobStatus::Failed {
            state.metrics.jobs_failed.inc();
        }
        info!(
            job_id = %job_id,
            node_id = %report.node_id,
            final_status = %final_status,
            reason = %reason,
            "job failure recorded"
        );
    }

    Ok(Json(state.store.get_job(job_id).await?))
}
