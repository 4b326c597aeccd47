//! Node surface: registration, heartbeats, drain requests.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use transcode_core::error::ApiError;
use transcode_core::protocol::{
    HeartbeatRequest, HeartbeatResponse, RegisterNodeRequest, RegisterNodeResponse,
};

use crate::server::app::AppState;
use crate::server::error::AppError;
use crate::server::middleware::{require_admin, require_tenant, AuthContext};
use crate::store::NodeRegistration;

/// POST /nodes/register — idempotent; re-registration refreshes capabilities.
pub async fn register_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = require_tenant(&auth)?;

    if req.address.trim().is_empty() {
        return Err(AppError(ApiError::Validation(
            "address must not be empty".into(),
        )));
    }

    let (node, created) = state
        .store
        .register_node(
            tenant.id,
            NodeRegistration {
                id: req.id,
                address: req.address,
                node_type: req.node_type,
                capabilities: req.capabilities,
                ram_bytes: req.ram_bytes,
                labels: req.labels,
            },
        )
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RegisterNodeResponse {
            node_id: node.id,
            created,
        }),
    ))
}

/// POST /nodes/{id}/heartbeat — refresh liveness, echo the desired state,
/// and touch activity on the jobs the worker says it is running.
pub async fn node_heartbeat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let tenant = require_tenant(&auth)?;
    let node = state.store.get_node(id).await?;
    if node.tenant_id != tenant.id {
        return Err(AppError(ApiError::NotFound(format!("node {id}"))));
    }

    let desired_state = state.store.update_node_heartbeat(id).await?;

    if let Some(Json(req)) = body {
        for job_id in req.running_jobs {
            // Best effort; a job that finished between poll and heartbeat is fine.
            let _ = state.store.update_job_heartbeat(job_id).await;
        }
    }

    Ok(Json(HeartbeatResponse { desired_state }))
}

/// POST /nodes/{id}/drain — admin: ask the worker to drain at its next
/// heartbeat.
pub async fn drain_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    state.store.request_node_drain(id).await?;
    Ok(StatusCode::OK)
}
