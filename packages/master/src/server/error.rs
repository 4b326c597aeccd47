//! Maps the shared error taxonomy onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use transcode_core::error::ApiError;
use transcode_core::protocol::ErrorBody;
use transcode_core::tenant::QuotaViolation;

/// Handler-level error wrapper so `?` works on store calls.
pub struct AppError(pub ApiError);

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self(ApiError::Database(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            // A suspended tenant is a 403; an exceeded limit is a 429.
            ApiError::QuotaExceeded(QuotaViolation::TenantNotActive(_)) => {
                (StatusCode::FORBIDDEN, None)
            }
            ApiError::QuotaExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, None),
            ApiError::CapabilityMismatch(_) => (StatusCode::CONFLICT, None),
            ApiError::Conflict(e) => (
                StatusCode::CONFLICT,
                Some(format!("from={} to={}", e.from, e.to)),
            ),
            ApiError::AssignmentConflict { .. } => (StatusCode::CONFLICT, None),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            ApiError::Database(e) => {
                tracing::error!(error = %e, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let body = ErrorBody {
            error: self.0.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}
