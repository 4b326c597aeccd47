//! Error taxonomy surfaced by the master API and shared by its callers.

use crate::fsm::TransitionError;
use crate::tenant::QuotaViolation;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client-caused, not retriable. Maps to 400.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing or unknown bearer token. Maps to 401.
    #[error("unauthorized")]
    Unauthorized,

    /// Suspended tenant or cross-tenant access. Maps to 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A per-tenant limit blocked admission. Maps to 429.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(#[from] QuotaViolation),

    /// The fleet cannot satisfy a requested encoder. Maps to 409 when
    /// detected synchronously before create.
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// An illegal FSM transition. Maps to 409 with the (from, to) pair.
    #[error(transparent)]
    Conflict(#[from] TransitionError),

    /// A job already belongs to a different worker.
    #[error("job {job_id} is assigned to another worker")]
    AssignmentConflict { job_id: uuid::Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected store error. Maps to 500; safe for the client to retry.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    /// Whether a caller may reasonably retry the same request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ApiError::Database(_) | ApiError::Internal(_))
    }
}
