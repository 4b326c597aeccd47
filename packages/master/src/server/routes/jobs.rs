//! Job surface: submission, listing, control transitions, worker pulls.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use transcode_core::error::ApiError;
use transcode_core::job::{Job, JobStatus};
use transcode_core::protocol::{CreateJobRequest, JobControlRequest, ListJobsQuery, NextJobQuery};

use crate::server::app::AppState;
use crate::server::error::AppError;
use crate::server::middleware::{require_tenant, AuthContext};
use crate::store::{Admission, JobFilter, NewJob};

/// POST /jobs — admission (quota + fleet capability), sequence allocation,
/// initial transition to queued or rejected.
pub async fn create_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = require_tenant(&auth)?;

    if req.scenario.trim().is_empty() {
        return Err(AppError(ApiError::Validation(
            "scenario must not be empty".into(),
        )));
    }
    if !req.parameters.is_null() && !req.parameters.is_object() {
        return Err(AppError(ApiError::Validation(
            "parameters must be an object".into(),
        )));
    }
    let max_retries = req.max_retries.unwrap_or(state.store.retry_policy().max_retries);
    if max_retries < 0 {
        return Err(AppError(ApiError::Validation(
            "max_retries must not be negative".into(),
        )));
    }

    let admission = if state
        .store
        .fleet_supports(tenant.id, &req.required_capabilities)
        .await?
    {
        Admission::Queued
    } else {
        let missing = req
            .required_capabilities
            .join(", ");
        Admission::Rejected { missing }
    };
    let rejected = matches!(admission, Admission::Rejected { .. });

    let parameters = if req.parameters.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        req.parameters
    };

    let job = state
        .store
        .create_job(
            tenant.id,
            NewJob {
                scenario: req.scenario,
                engine: req.engine,
                queue: req.queue,
                priority: req.priority,
                classification: req.classification,
                parameters,
                required_capabilities: req.required_capabilities,
                wrapper_constraints: req.wrapper_constraints.unwrap_or_default(),
                max_retries,
            },
            admission,
        )
        .await?;

    state.metrics.jobs_created.inc();
    if rejected {
        state.metrics.jobs_rejected.inc();
    }

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs — list, scoped to the caller's tenant.
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    let tenant = require_tenant(&auth)?;
    let jobs = state
        .store
        .list_jobs(JobFilter {
            tenant_id: Some(tenant.id),
            status: query.status,
            queue: query.queue,
            node_id: query.node_id,
            limit: query.limit,
        })
        .await?;
    Ok(Json(jobs))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_tenant_job(&state, &auth, id).await?;
    Ok(Json(job))
}

/// POST /jobs/{id}/pause
pub async fn pause_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<JobControlRequest>>,
) -> Result<Json<Job>, AppError> {
    control_transition(&state, &auth, id, JobStatus::Paused, body, "paused by operator").await
}

/// POST /jobs/{id}/resume
pub async fn resume_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<JobControlRequest>>,
) -> Result<Json<Job>, AppError> {
    control_transition(&state, &auth, id, JobStatus::Running, body, "resumed by operator").await
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<JobControlRequest>>,
) -> Result<Json<Job>, AppError> {
    control_transition(&state, &auth, id, JobStatus::Canceled, body, "canceled by operator").await
}

/// DELETE /jobs/{id} — alias of cancel on non-terminal states.
pub async fn delete_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    control_transition(&state, &auth, id, JobStatus::Canceled, None, "canceled by operator").await
}

/// GET /jobs/next?node_id= — worker pull. The returned job is atomically
/// moved to assigned on that node; 204 when the backlog is empty.
pub async fn next_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<NextJobQuery>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = require_tenant(&auth)?;
    let node = state.store.get_node(query.node_id).await?;
    if node.tenant_id != tenant.id {
        return Err(AppError(ApiError::Forbidden(
            "node belongs to another tenant".into(),
        )));
    }

    match state.store.claim_next_job_for_node(query.node_id).await? {
        Some(job) => Ok((StatusCode::OK, Json(job)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /jobs/{id}/start — worker reports the encoder is executing.
pub async fn start_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    let job = fetch_tenant_job(&state, &auth, id).await?;
    state
        .store
        .transition_job_state(job.id, JobStatus::Running, "worker started encoder")
        .await?;
    Ok(Json(state.store.get_job(id).await?))
}

/// POST /jobs/{id}/heartbeat — refresh activity for a running job.
pub async fn job_heartbeat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    fetch_tenant_job(&state, &auth, id).await?;
    state.store.update_job_heartbeat(id).await?;
    Ok(StatusCode::OK)
}

async fn control_transition(
    state: &AppState,
    auth: &AuthContext,
    id: Uuid,
    to: JobStatus,
    body: Option<Json<JobControlRequest>>,
    default_reason: &str,
) -> Result<Json<Job>, AppError> {
    let job = fetch_tenant_job(state, auth, id).await?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| default_reason.to_string());

    state.store.transition_job_state(job.id, to, &reason).await?;
    Ok(Json(state.store.get_job(id).await?))
}

async fn fetch_tenant_job(
    state: &AppState,
    auth: &AuthContext,
    id: Uuid,
) -> Result<Job, AppError> {
    let tenant = require_tenant(auth)?;
    let job = state.store.get_job(id).await?;
    if job.tenant_id != tenant.id {
        // Cross-tenant access reads as absence, not as a hint the id exists.
        return Err(AppError(ApiError::NotFound(format!("job {id}"))));
    }
    Ok(job)
}
