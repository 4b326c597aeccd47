//! Tenant model: the isolation boundary for quotas and resource access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Name of the pre-seeded tenant that always exists and cannot be deleted.
pub const DEFAULT_TENANT_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "tenant_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
    Expired,
    /// Soft delete; the row survives while jobs or nodes reference it.
    Deleted,
}

/// Admission limits. A zero value means unlimited for that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuotas {
    pub max_jobs: i32,
    pub max_workers: i32,
    pub max_jobs_per_hour: i32,
    pub max_cpu_cores: i32,
    pub max_gpus: i32,
    pub max_storage_bytes: i64,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            max_workers: 10,
            max_jobs_per_hour: 1000,
            max_cpu_cores: 0,
            max_gpus: 0,
            max_storage_bytes: 0,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub plan: String,
    pub status: TenantStatus,

    // Quotas (flattened columns)
    pub max_jobs: i32,
    pub max_workers: i32,
    pub max_jobs_per_hour: i32,
    pub max_cpu_cores: i32,
    pub max_gpus: i32,
    pub max_storage_bytes: i64,

    // Usage counters, maintained in the same transactions that admit and
    // complete jobs. Converge to the corresponding store queries.
    pub active_jobs: i32,
    pub active_workers: i32,
    pub cpu_in_use: i32,
    pub gpu_in_use: i32,
    pub jobs_this_hour: i32,
    pub hour_window_start: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn quotas(&self) -> TenantQuotas {
        TenantQuotas {
            max_jobs: self.max_jobs,
            max_workers: self.max_workers,
            max_jobs_per_hour: self.max_jobs_per_hour,
            max_cpu_cores: self.max_cpu_cores,
            max_gpus: self.max_gpus,
            max_storage_bytes: self.max_storage_bytes,
        }
    }

    /// Whether the rolling jobs-per-hour window has lapsed and the counter
    /// should reset before the next admission check.
    pub fn hour_window_lapsed(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.hour_window_start) >= chrono::Duration::hours(1)
    }

    /// Admission check for one more job. Returns the violated limit on
    /// rejection. Zero-valued quotas are unlimited.
    pub fn admit_job(&self, now: DateTime<Utc>) -> Result<(), QuotaViolation> {
        if self.status != TenantStatus::Active {
            return Err(QuotaViolation::TenantNotActive(self.status));
        }
        if self.max_jobs > 0 && self.active_jobs >= self.max_jobs {
            return Err(QuotaViolation::MaxJobs(self.max_jobs));
        }
        let hourly = if self.hour_window_lapsed(now) {
            0
        } else {
            self.jobs_this_hour
        };
        if self.max_jobs_per_hour > 0 && hourly >= self.max_jobs_per_hour {
            return Err(QuotaViolation::MaxJobsPerHour(self.max_jobs_per_hour));
        }
        Ok(())
    }

    /// Admission check for one more registered worker.
    pub fn admit_worker(&self) -> Result<(), QuotaViolation> {
        if self.status != TenantStatus::Active {
            return Err(QuotaViolation::TenantNotActive(self.status));
        }
        if self.max_workers > 0 && self.active_workers >= self.max_workers {
            return Err(QuotaViolation::MaxWorkers(self.max_workers));
        }
        Ok(())
    }
}

/// A specific quota limit that blocked admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuotaViolation {
    #[error("tenant is {0:?}")]
    TenantNotActive(TenantStatus),
    #[error("active job limit of {0} reached")]
    MaxJobs(i32),
    #[error("hourly job limit of {0} reached")]
    MaxJobsPerHour(i32),
    #[error("worker limit of {0} reached")]
    MaxWorkers(i32),
}
