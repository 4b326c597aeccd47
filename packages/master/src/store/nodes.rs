//! Node persistence: registration, heartbeats, liveness, fleet queries.

use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use transcode_core::error::ApiError;
use transcode_core::node::{Node, NodeCapabilities, NodeStatus, NodeType};
use transcode_core::protocol::DesiredWorkerState;

use super::Store;

pub(crate) const NODE_COLUMNS: &str = "id, address, tenant_id, node_type, status, capabilities, ram_bytes, labels, \
     current_job_id, last_heartbeat, last_assigned_at, registered_at, updated_at";

/// Registration payload after the API resolved the tenant.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub id: Option<Uuid>,
    pub address: String,
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    pub ram_bytes: i64,
    pub labels: BTreeMap<String, String>,
}

impl Store {
    /// Idempotent registration: a known node id (or the same tenant+address)
    /// refreshes capabilities in place, a new one checks the worker quota and
    /// inserts. Returns the node and whether it was created.
    pub async fn register_node(
        &self,
        tenant_id: Uuid,
        reg: NodeRegistration,
    ) -> Result<(Node, bool), ApiError> {
        let mut tx = self.pool().begin().await?;
        let tenant = super::tenants::lock_tenant(&mut tx, tenant_id).await?;

        let existing = match reg.id {
            Some(id) => {
                sqlx::query_as::<_, Node>(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1 FOR UPDATE",
                ))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, Node>(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE tenant_id = $1 AND address = $2 FOR UPDATE",
                ))
                .bind(tenant_id)
                .bind(&reg.address)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        if let Some(node) = existing {
            if node.tenant_id != tenant_id {
                return Err(ApiError::Forbidden(format!(
                    "node {} belongs to another tenant",
                    node.id
                )));
            }

            let was_offline = node.status == NodeStatus::Offline;
            let updated = sqlx::query_as::<_, Node>(&format!(
                r#"
                UPDATE nodes SET
                    address = $2,
                    node_type = $3,
                    capabilities = $4,
                    ram_bytes = $5,
                    labels = $6,
                    status = CASE WHEN status = 'offline' THEN 'available'::node_status ELSE status END,
                    last_heartbeat = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING {NODE_COLUMNS}
                "#
            ))
            .bind(node.id)
            .bind(&reg.address)
            .bind(reg.node_type)
            .bind(Json(&reg.capabilities))
            .bind(reg.ram_bytes)
            .bind(Json(&reg.labels))
            .fetch_one(&mut *tx)
            .await?;

            if was_offline {
                sqlx::query(
                    "UPDATE tenants SET active_workers = active_workers + 1, updated_at = NOW() WHERE id = $1",
                )
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            info!(node_id = %updated.id, address = %updated.address, "node re-registered");
            return Ok((updated, false));
        }

        tenant.admit_worker()?;

        let node = sqlx::query_as::<_, Node>(&format!(
            r#"
            INSERT INTO nodes (id, address, tenant_id, node_type, status, capabilities, ram_bytes, labels)
            VALUES ($1, $2, $3, $4, 'available', $5, $6, $7)
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(reg.id.unwrap_or_else(Uuid::new_v4))
        .bind(&reg.address)
        .bind(tenant_id)
        .bind(reg.node_type)
        .bind(Json(&reg.capabilities))
        .bind(reg.ram_bytes)
        .bind(Json(&reg.labels))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tenants SET active_workers = active_workers + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(node_id = %node.id, address = %node.address, "node registered");
        Ok((node, true))
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Node, ApiError> {
        sqlx::query_as::<_, Node>(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("node {id}")))
    }

    pub async fn get_nodes_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Node>, ApiError> {
        let nodes = sqlx::query_as::<_, Node>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE tenant_id = $1 ORDER BY registered_at ASC",
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;
        Ok(nodes)
    }

    pub async fn update_node_status(
        &self,
        node_id: Uuid,
        status: NodeStatus,
    ) -> Result<(), ApiError> {
        let updated = sqlx::query("UPDATE nodes SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(node_id)
            .bind(status)
            .execute(self.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ApiError::NotFound(format!("node {node_id}")));
        }
        Ok(())
    }

    /// Refresh liveness and report the desired worker state back to the
    /// caller. An offline node heartbeating again comes back as available.
    pub async fn update_node_heartbeat(
        &self,
        node_id: Uuid,
    ) -> Result<DesiredWorkerState, ApiError> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE nodes SET
                last_heartbeat = NOW(),
                status = CASE WHEN status = 'offline' THEN 'available'::node_status ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING drain_requested
            "#,
        )
        .bind(node_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some((true,)) => Ok(DesiredWorkerState::Drain),
            Some((false,)) => Ok(DesiredWorkerState::Active),
            None => Err(ApiError::NotFound(format!("node {node_id}"))),
        }
    }

    /// Ask a worker to drain at its next heartbeat.
    pub async fn request_node_drain(&self, node_id: Uuid) -> Result<(), ApiError> {
        let updated =
            sqlx::query("UPDATE nodes SET drain_requested = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(node_id)
                .execute(self.pool())
                .await?
                .rows_affected();
        if updated == 0 {
            return Err(ApiError::NotFound(format!("node {node_id}")));
        }
        Ok(())
    }

    /// Available workers of a tenant whose capability set covers `required`,
    /// least recently assigned first.
    pub async fn get_available_nodes(
        &self,
        tenant_id: Uuid,
        required: &[String],
    ) -> Result<Vec<Node>, ApiError> {
        let nodes = sqlx::query_as::<_, Node>(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes
            WHERE tenant_id = $1 AND status = 'available' AND current_job_id IS NULL
            ORDER BY last_assigned_at ASC NULLS FIRST
            "#
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        Ok(nodes
            .into_iter()
            .filter(|n| {
                let tags = n.capabilities.all_tags();
                required.iter().all(|r| tags.iter().any(|t| t == r))
            })
            .collect())
    }

    /// Whether any non-offline node of the tenant covers `required`.
    /// Admission uses this for the capability-mismatch rejection.
    pub async fn fleet_supports(
        &self,
        tenant_id: Uuid,
        required: &[String],
    ) -> Result<bool, ApiError> {
        if required.is_empty() {
            return Ok(true);
        }
        let nodes = sqlx::query_as::<_, Node>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE tenant_id = $1 AND status != 'offline'",
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        Ok(nodes.iter().any(|n| {
            let tags = n.capabilities.all_tags();
            required.iter().all(|r| tags.iter().any(|t| t == r))
        }))
    }

    /// Flip nodes whose heartbeat aged past the threshold to offline.
    /// Returns the affected node ids.
    pub async fn mark_stale_nodes_offline(
        &self,
        worker_timeout: std::time::Duration,
    ) -> Result<Vec<Uuid>, ApiError> {
        let mut tx = self.pool().begin().await?;
        let stale: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id FROM nodes
            WHERE status != 'offline'
              AND last_heartbeat < NOW() - ($1 || ' seconds')::INTERVAL
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(worker_timeout.as_secs().to_string())
        .fetch_all(&mut *tx)
        .await?;

        let mut ids = Vec::with_capacity(stale.len());
        for (node_id, tenant_id) in stale {
            sqlx::query("UPDATE nodes SET status = 'offline', updated_at = NOW() WHERE id = $1")
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE tenants SET active_workers = GREATEST(active_workers - 1, 0), updated_at = NOW() WHERE id = $1",
            )
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
            ids.push(node_id);
        }

        tx.commit().await?;
        Ok(ids)
    }
}

pub(crate) async fn lock_node(
    tx: &mut Transaction<'_, Postgres>,
    node_id: Uuid,
) -> Result<Node, ApiError> {
    sqlx::query_as::<_, Node>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1 FOR UPDATE",
    ))
    .bind(node_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))
}
