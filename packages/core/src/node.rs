//! Node model: a registered worker host.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "node_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Available,
    Busy,
    Unhealthy,
    /// Set by the master when heartbeats stop arriving.
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "node_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Cpu,
    Gpu,
}

/// What a worker host can do, collected by probing at startup and refreshed
/// on re-registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub cpu_threads: u32,
    pub cpu_model: String,
    pub has_gpu: bool,
    pub gpu_type: Option<String>,
    /// Encoder capability tags, e.g. "nvenc_h264", "nvenc_h265", "x264".
    pub gpu_capabilities: Vec<String>,
    /// Software encoder tags available regardless of GPU, e.g. "x264", "x265".
    pub encoders: Vec<String>,
}

impl NodeCapabilities {
    /// Flat list of every capability tag this node advertises.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = self.encoders.clone();
        tags.extend(self.gpu_capabilities.iter().cloned());
        tags
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// host:port the agent serves its readiness endpoint on.
    pub address: String,
    pub tenant_id: Uuid,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub capabilities: Json<NodeCapabilities>,
    pub ram_bytes: i64,
    pub labels: Json<BTreeMap<String, String>>,
    /// Weak reference; the jobs table is the authority if they disagree.
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    /// Used by the scheduler to spread load (least recently assigned wins).
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Whether the node's last heartbeat is older than `timeout`.
    pub fn heartbeat_expired(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            > chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(90))
    }
}
