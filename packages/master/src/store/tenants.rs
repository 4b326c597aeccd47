//! Tenant persistence and quota accounting.

use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use transcode_core::error::ApiError;
use transcode_core::protocol::TenantStatsResponse;
use transcode_core::tenant::{Tenant, TenantQuotas, TenantStatus, DEFAULT_TENANT_NAME};

use super::Store;

pub(crate) const TENANT_COLUMNS: &str = "id, name, plan, status, max_jobs, max_workers, max_jobs_per_hour, max_cpu_cores, \
     max_gpus, max_storage_bytes, active_jobs, active_workers, cpu_in_use, gpu_in_use, \
     jobs_this_hour, hour_window_start, created_at, updated_at";

impl Store {
    pub async fn create_tenant(
        &self,
        name: &str,
        plan: &str,
        quotas: TenantQuotas,
    ) -> Result<Tenant, ApiError> {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("tenant name must not be empty".into()));
        }

        let mut tx = self.pool().begin().await?;
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            r#"
            INSERT INTO tenants (id, name, plan, max_jobs, max_workers, max_jobs_per_hour,
                                 max_cpu_cores, max_gpus, max_storage_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .bind(plan)
        .bind(quotas.max_jobs)
        .bind(quotas.max_workers)
        .bind(quotas.max_jobs_per_hour)
        .bind(quotas.max_cpu_cores)
        .bind(quotas.max_gpus)
        .bind(quotas.max_storage_bytes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Validation(format!("tenant {name} already exists"))
            }
            _ => ApiError::Database(e),
        })?;

        sqlx::query("INSERT INTO tenant_sequences (tenant_id) VALUES ($1)")
            .bind(tenant.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(tenant_id = %tenant.id, name = %tenant.name, "tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: Uuid) -> Result<Tenant, ApiError> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant {id}")))
    }

    pub async fn get_tenant_by_name(&self, name: &str) -> Result<Tenant, ApiError> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE name = $1",
        ))
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant {name}")))
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, ApiError> {
        let tenants = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE status != 'deleted' ORDER BY created_at ASC",
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(tenants)
    }

    pub async fn update_tenant(
        &self,
        id: Uuid,
        plan: Option<String>,
        status: Option<TenantStatus>,
        quotas: Option<TenantQuotas>,
    ) -> Result<Tenant, ApiError> {
        let mut tx = self.pool().begin().await?;
        let current = lock_tenant(&mut tx, id).await?;

        let quotas = quotas.unwrap_or_else(|| current.quotas());
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            r#"
            UPDATE tenants SET
                plan = $2,
                status = $3,
                max_jobs = $4,
                max_workers = $5,
                max_jobs_per_hour = $6,
                max_cpu_cores = $7,
                max_gpus = $8,
                max_storage_bytes = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(plan.unwrap_or(current.plan))
        .bind(status.unwrap_or(current.status))
        .bind(quotas.max_jobs)
        .bind(quotas.max_workers)
        .bind(quotas.max_jobs_per_hour)
        .bind(quotas.max_cpu_cores)
        .bind(quotas.max_gpus)
        .bind(quotas.max_storage_bytes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tenant)
    }

    /// Soft delete. The pre-seeded default tenant is protected.
    pub async fn delete_tenant(&self, id: Uuid) -> Result<(), ApiError> {
        let mut tx = self.pool().begin().await?;
        let tenant = lock_tenant(&mut tx, id).await?;

        if tenant.name == DEFAULT_TENANT_NAME {
            return Err(ApiError::Forbidden(
                "the default tenant cannot be deleted".into(),
            ));
        }

        sqlx::query("UPDATE tenants SET status = 'deleted', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(tenant_id = %id, name = %tenant.name, "tenant soft-deleted");
        Ok(())
    }

    /// Live stats computed from the jobs and nodes tables; the usage counters
    /// on the tenant row are the transactional view, these are the queries
    /// they converge to.
    pub async fn get_tenant_stats(&self, id: Uuid) -> Result<TenantStatsResponse, ApiError> {
        let tenant = self.get_tenant(id).await?;

        let (active_jobs, queued_jobs, completed_jobs, failed_jobs): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status IN ('pending', 'queued', 'assigned', 'running', 'paused', 'retrying')),
                    COUNT(*) FILTER (WHERE status = 'queued'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status IN ('failed', 'timed_out', 'rejected'))
                FROM jobs WHERE tenant_id = $1
                "#,
            )
            .bind(id)
            .fetch_one(self.pool())
            .await?;

        let active_workers: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes WHERE tenant_id = $1 AND status != 'offline'",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;

        Ok(TenantStatsResponse {
            tenant_id: id,
            active_jobs,
            queued_jobs,
            completed_jobs,
            failed_jobs,
            active_workers,
            jobs_this_hour: tenant.jobs_this_hour,
        })
    }
}

pub(crate) async fn lock_tenant(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
) -> Result<Tenant, ApiError> {
    sqlx::query_as::<_, Tenant>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 FOR UPDATE",
    ))
    .bind(tenant_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("tenant {tenant_id}")))
}
