//! Tenant administration surface.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use transcode_core::node::Node;
use transcode_core::protocol::{CreateTenantRequest, TenantStatsResponse, UpdateTenantRequest};
use transcode_core::tenant::Tenant;

use crate::server::app::AppState;
use crate::server::error::AppError;
use crate::server::middleware::{require_admin, AuthContext};

/// POST /tenants
pub async fn create_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&auth)?;
    let tenant = state
        .store
        .create_tenant(&req.name, &req.plan, req.quotas.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

/// GET /tenants
pub async fn list_tenants(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Tenant>>, AppError> {
    require_admin(&auth)?;
    Ok(Json(state.store.list_tenants().await?))
}

/// GET /tenants/{id}
pub async fn get_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, AppError> {
    require_admin(&auth)?;
    Ok(Json(state.store.get_tenant(id).await?))
}

/// PUT /tenants/{id}
pub async fn update_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTenantRequest>,
) -> Result<Json<Tenant>, AppError> {
    require_admin(&auth)?;
    let tenant = state
        .store
        .update_tenant(id, req.plan, req.status, req.quotas)
        .await?;
    Ok(Json(tenant))
}

/// DELETE /tenants/{id} — soft delete; the default tenant is protected.
pub async fn delete_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    state.store.delete_tenant(id).await?;
    Ok(StatusCode::OK)
}

/// GET /tenants/{id}/stats
pub async fn tenant_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantStatsResponse>, AppError> {
    require_admin(&auth)?;
    Ok(Json(state.store.get_tenant_stats(id).await?))
}

/// GET /tenants/{id}/jobs
pub async fn tenant_jobs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<transcode_core::job::Job>>, AppError> {
    require_admin(&auth)?;
    Ok(Json(state.store.get_jobs_by_tenant(id).await?))
}

/// GET /tenants/{id}/nodes
pub async fn tenant_nodes(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Node>>, AppError> {
    require_admin(&auth)?;
    Ok(Json(state.store.get_nodes_by_tenant(id).await?))
}
