//! Wire protocol types for the master HTTP API.
//!
//! UTF-8 JSON; timestamps RFC 3339; enums lowercase. Unknown fields are
//! rejected on input and ignored on output for forward compatibility.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{
    EngineKind, FailureClass, JobClass, JobPriority, JobStatus, QueueClass, WrapperConstraints,
};
use crate::node::{NodeCapabilities, NodeType};
use crate::tenant::{TenantQuotas, TenantStatus};

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub scenario: String,
    #[serde(default)]
    pub queue: QueueClass,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default)]
    pub classification: JobClass,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Capability tags a worker must advertise, e.g. ["nvenc_h265"].
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub wrapper_constraints: Option<WrapperConstraints>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub queue: Option<QueueClass>,
    pub node_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Control-transition request bodies carry an optional operator note.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobControlRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterNodeRequest {
    /// Present on re-registration; a matching row is updated in place.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub address: String,
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    pub ram_bytes: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_id: Uuid,
    /// False when an existing registration was refreshed.
    pub created: bool,
}

/// What the master wants the worker to do next, piggybacked on heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DesiredWorkerState {
    #[default]
    Active,
    /// Stop accepting jobs, finish what is running, then exit.
    Drain,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    /// Jobs the worker believes it is currently executing. The master uses
    /// this to refresh per-job activity, not as an authority on assignment.
    #[serde(default)]
    pub running_jobs: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub desired_state: DesiredWorkerState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NextJobQuery {
    pub node_id: Uuid,
}

// ============================================================================
// Wrapper results
// ============================================================================

/// How the wrapper governed the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperMode {
    /// Forked a fresh process group containing the encoder.
    Run,
    /// Observed an already-running PID.
    Attach,
}

impl std::fmt::Display for WrapperMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapperMode::Run => f.write_str("run"),
            WrapperMode::Attach => f.write_str("attach"),
        }
    }
}

/// The immutable post-mortem record the wrapper emits exactly once.
///
/// The platform outcome (`platform_sla_met`) and the workload outcome
/// (`exit_code`) are recorded separately: a clean exit with a non-zero code
/// still meets the platform SLA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperResult {
    pub job_id: Uuid,
    pub pid: u32,
    pub mode: WrapperMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// None when the process was reaped without a code (e.g. signaled).
    pub exit_code: Option<i32>,
    pub platform_sla_met: bool,
    pub platform_sla_reason: String,
    /// What the supervisor was asked to do, e.g. the argv it governed.
    pub intent: String,
}

impl WrapperResult {
    pub fn workload_succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Worker → master final report for a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultReport {
    pub node_id: Uuid,
    pub result: WrapperResult,
    /// Encoder stderr tail or transport error, when the workload failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_classification: Option<FailureClass>,
}

// ============================================================================
// Tenants (admin surface)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTenantRequest {
    pub name: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub quotas: Option<TenantQuotas>,
}

fn default_plan() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTenantRequest {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub status: Option<TenantStatus>,
    #[serde(default)]
    pub quotas: Option<TenantQuotas>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStatsResponse {
    pub tenant_id: Uuid,
    pub active_jobs: i64,
    pub queued_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub active_workers: i64,
    pub jobs_this_hour: i32,
}

// ============================================================================
// Errors on the wire
// ============================================================================

/// JSON error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_job_request_rejects_unknown_fields() {
        let body = r#"{"scenario": "1080p30-h264", "bogus": true}"#;
        assert!(serde_json::from_str::<CreateJobRequest>(body).is_err());
    }

    #[test]
    fn create_job_request_fills_defaults() {
        let body = r#"{"scenario": "1080p30-h264"}"#;
        let req: CreateJobRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.queue, QueueClass::Default);
        assert_eq!(req.priority, JobPriority::Medium);
        assert_eq!(req.engine, EngineKind::Auto);
        assert!(req.required_capabilities.is_empty());
    }

    #[test]
    fn wrapper_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&WrapperMode::Run).unwrap(), "\"run\"");
        assert_eq!(
            serde_json::to_string(&WrapperMode::Attach).unwrap(),
            "\"attach\""
        );
    }

    #[test]
    fn wrapper_result_workload_outcome_is_separate() {
        let result = WrapperResult {
            job_id: Uuid::new_v4(),
            pid: 4242,
            mode: WrapperMode::Run,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_ms: 1500,
            exit_code: Some(1),
            platform_sla_met: true,
            platform_sla_reason: "workload_failed_platform_ok".into(),
            intent: "ffmpeg -i in.mp4 out.mp4".into(),
        };
        assert!(!result.workload_succeeded());
        assert!(result.platform_sla_met);
    }

    #[test]
    fn desired_state_defaults_to_active() {
        assert_eq!(DesiredWorkerState::default(), DesiredWorkerState::Active);
    }
}
