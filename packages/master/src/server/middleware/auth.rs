//! Bearer-token authentication.
//!
//! Tokens are static: a configured map of token -> tenant name, plus an
//! optional admin token for the tenant administration surface. `/health` and
//! `/metrics` are mounted outside this middleware.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use transcode_core::error::ApiError;
use transcode_core::tenant::{Tenant, TenantStatus};

use crate::server::app::AppState;
use crate::server::error::AppError;

/// Who the bearer token resolved to.
#[derive(Clone)]
pub enum AuthContext {
    Tenant(Tenant),
    Admin,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let context = if state.admin_token.as_deref() == Some(token.as_str()) {
        AuthContext::Admin
    } else {
        let tenant_name = state
            .auth_tokens
            .get(&token)
            .ok_or(ApiError::Unauthorized)?;
        let tenant = match state.store.get_tenant_by_name(tenant_name).await {
            Ok(tenant) => tenant,
            // A token mapped to a missing tenant is an auth failure; a store
            // outage is not.
            Err(ApiError::NotFound(_)) => return Err(AppError(ApiError::Unauthorized)),
            Err(e) => return Err(AppError(e)),
        };
        if tenant.status == TenantStatus::Deleted {
            return Err(AppError(ApiError::Unauthorized));
        }
        AuthContext::Tenant(tenant)
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Resolve the caller's tenant; admin tokens act as the default tenant's
/// operator only on the admin surface, not here.
pub fn require_tenant(context: &AuthContext) -> Result<&Tenant, AppError> {
    match context {
        AuthContext::Tenant(tenant) => Ok(tenant),
        AuthContext::Admin => Err(AppError(ApiError::Forbidden(
            "tenant token required".into(),
        ))),
    }
}

pub fn require_admin(context: &AuthContext) -> Result<(), AppError> {
    match context {
        AuthContext::Admin => Ok(()),
        AuthContext::Tenant(_) => Err(AppError(ApiError::Forbidden("admin token required".into()))),
    }
}
