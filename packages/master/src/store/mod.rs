//! Persistent state for the control plane.
//!
//! The store is the sole owner of jobs, nodes, and tenants. Every state
//! change happens inside a transaction with the affected rows locked
//! (`SELECT ... FOR UPDATE`), so all transitions for a given job are
//! linearly ordered. Higher layers never touch the database directly.

mod jobs;
mod nodes;
mod tenants;

pub use jobs::{Admission, JobFilter, NewJob};
pub use nodes::NodeRegistration;

use sqlx::postgres::PgPool;
use transcode_core::fsm::{RetryPolicy, TimeoutPolicy};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    retry: RetryPolicy,
    timeouts: TimeoutPolicy,
}

impl Store {
    pub fn new(pool: PgPool, retry: RetryPolicy, timeouts: TimeoutPolicy) -> Self {
        Self {
            pool,
            retry,
            timeouts,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout_policy(&self) -> &TimeoutPolicy {
        &self.timeouts
    }
}
