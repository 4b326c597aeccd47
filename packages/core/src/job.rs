//! Job model: the unit of transcoding work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle states of a job. Transitions between them are governed by the
/// relation in [`crate::fsm::validate_transition`]; nothing else may move a
/// job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the API, awaiting admission (quota + capability checks).
    #[default]
    Pending,
    /// Admitted, waiting for a worker.
    Queued,
    /// Bound to a worker, not yet running.
    Assigned,
    /// A worker is executing the encoder.
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
    /// Waiting out the retry backoff before re-queueing.
    Retrying,
    Rejected,
    Canceled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::TimedOut
                | JobStatus::Rejected
                | JobStatus::Canceled
        )
    }

    /// States in which the job occupies a worker and must carry a node_id.
    pub fn holds_node(&self) -> bool {
        matches!(
            self,
            JobStatus::Assigned | JobStatus::Running | JobStatus::Paused
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Retrying => "retrying",
            JobStatus::Rejected => "rejected",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse priority class. Interacts multiplicatively with [`JobPriority`] and
/// additively with aging when the scheduler orders candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_queue", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Live,
    #[default]
    Default,
    Batch,
}

impl QueueClass {
    /// Weight for scheduling order (higher = sooner).
    pub fn weight(&self) -> i64 {
        match self {
            QueueClass::Live => 2,
            QueueClass::Default => 1,
            QueueClass::Batch => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl JobPriority {
    /// Weight for scheduling order (higher = sooner). One aging bucket equals
    /// one level of this weight.
    pub fn weight(&self) -> i64 {
        match self {
            JobPriority::High => 2,
            JobPriority::Medium => 1,
            JobPriority::Low => 0,
        }
    }
}

/// Which encoder runs the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_engine", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Ffmpeg,
    Gstreamer,
    /// Resolved by the worker at execution time (see engine selection rule).
    #[default]
    Auto,
}

/// Why a job ended up failed or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "failure_class", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The fleet (or the assigned worker) lacks a required encoder capability.
    /// Detected before assignment; never retried.
    CapabilityMismatch,
    /// The encoder subprocess returned non-zero or crashed.
    RuntimeError,
    /// The job exceeded its computed timeout.
    Timeout,
    /// Malformed parameters or encoder-rejected input. Never retried.
    UserError,
}

impl FailureClass {
    /// Whether this class is ever eligible for retry. Retries apply to
    /// transport and supervision failures, never to encoder work that ended
    /// with a non-transient failure.
    pub fn retry_eligible(&self) -> bool {
        matches!(self, FailureClass::RuntimeError | FailureClass::Timeout)
    }
}

/// What the job is for. Purely informational; scheduling ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_class", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    #[default]
    Production,
    Test,
    Benchmark,
    Debug,
}

// ============================================================================
// Embedded records
// ============================================================================

/// One entry in the append-only per-job transition log. The first entry of
/// every job records its creation (`from: None`, `to: pending`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Cgroup limits the wrapper applies around the encoder. All fields map
/// directly onto cgroup v2 interface files; `None` leaves the limit unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WrapperConstraints {
    /// `cpu.max`, e.g. "200000 100000" (2 CPUs).
    pub cpu_max: Option<String>,
    /// `cpu.weight`, 1..=10000.
    pub cpu_weight: Option<u32>,
    /// `memory.max` in bytes.
    pub memory_max: Option<u64>,
    /// `io.max`, e.g. "8:0 rbps=1048576".
    pub io_max: Option<String>,
}

impl WrapperConstraints {
    pub fn is_empty(&self) -> bool {
        self.cpu_max.is_none()
            && self.cpu_weight.is_none()
            && self.memory_max.is_none()
            && self.io_max.is_none()
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Identity
    pub tenant_id: Uuid,
    /// Monotonic, gap-free per tenant; allocated in the insert transaction.
    #[builder(default = 0)]
    pub sequence_number: i64,
    /// Named encoding profile, e.g. "1080p30-h264".
    pub scenario: String,

    // Placement
    #[builder(default)]
    pub engine: EngineKind,
    #[builder(default)]
    pub queue: QueueClass,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default)]
    pub classification: JobClass,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub node_id: Option<Uuid>,

    // Payload
    #[builder(default = Json(serde_json::Value::Object(Default::default())))]
    pub parameters: Json<serde_json::Value>,
    /// Capability tags a worker must advertise to run this job.
    #[builder(default)]
    pub required_capabilities: Vec<String>,
    #[builder(default = Json(WrapperConstraints::default()))]
    pub wrapper_constraints: Json<WrapperConstraints>,

    // Retry tracking
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    /// Earliest instant a retrying job may go back to queued.
    #[builder(default, setter(strip_option))]
    pub retry_at: Option<DateTime<Utc>>,

    // Failure record
    #[builder(default, setter(strip_option))]
    pub failure_reason: Option<String>,
    #[builder(default, setter(strip_option))]
    pub failure_classification: Option<FailureClass>,

    // Transition log
    #[builder(default = Json(Vec::new()))]
    pub state_transitions: Json<Vec<StateTransition>>,

    /// The wrapper result record attached on completion.
    #[builder(default)]
    pub result_metadata: Option<Json<serde_json::Value>>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub last_activity_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Declared expected duration of the encode, read from parameters.
    pub fn expected_duration(&self) -> Option<std::time::Duration> {
        self.parameters
            .get("duration_seconds")
            .and_then(|v| v.as_f64())
            .filter(|secs| *secs > 0.0)
            .map(std::time::Duration::from_secs_f64)
    }

    /// Whether another retry attempt is still allowed.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether a node satisfies this job's capability requirements.
    pub fn runnable_on(&self, capabilities: &[String]) -> bool {
        self.required_capabilities
            .iter()
            .all(|req| capabilities.iter().any(|c| c == req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .tenant_id(Uuid::new_v4())
            .scenario("1080p30-h264")
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.queue, QueueClass::Default);
        assert_eq!(job.priority, JobPriority::Medium);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.node_id.is_none());
    }

    #[test]
    fn terminal_states_are_exactly_five() {
        let terminal: Vec<JobStatus> = [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Assigned,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Retrying,
            JobStatus::Rejected,
            JobStatus::Canceled,
        ]
        .into_iter()
        .filter(JobStatus::is_terminal)
        .collect();

        assert_eq!(
            terminal,
            vec![
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::TimedOut,
                JobStatus::Rejected,
                JobStatus::Canceled,
            ]
        );
    }

    #[test]
    fn node_holding_states() {
        assert!(JobStatus::Assigned.holds_node());
        assert!(JobStatus::Running.holds_node());
        assert!(JobStatus::Paused.holds_node());
        assert!(!JobStatus::Queued.holds_node());
        assert!(!JobStatus::Completed.holds_node());
    }

    #[test]
    fn queue_weight_ordering() {
        assert!(QueueClass::Live.weight() > QueueClass::Default.weight());
        assert!(QueueClass::Default.weight() > QueueClass::Batch.weight());
    }

    #[test]
    fn priority_weight_ordering() {
        assert!(JobPriority::High.weight() > JobPriority::Medium.weight());
        assert!(JobPriority::Medium.weight() > JobPriority::Low.weight());
    }

    #[test]
    fn capability_mismatch_is_never_retry_eligible() {
        assert!(!FailureClass::CapabilityMismatch.retry_eligible());
        assert!(!FailureClass::UserError.retry_eligible());
        assert!(FailureClass::RuntimeError.retry_eligible());
        assert!(FailureClass::Timeout.retry_eligible());
    }

    #[test]
    fn runnable_on_requires_all_capabilities() {
        let mut job = sample_job();
        job.required_capabilities = vec!["nvenc_h264".into(), "nvenc_h265".into()];

        let full = vec!["nvenc_h264".to_string(), "nvenc_h265".to_string()];
        let partial = vec!["nvenc_h264".to_string()];

        assert!(job.runnable_on(&full));
        assert!(!job.runnable_on(&partial));
        assert!(!job.runnable_on(&[]));
    }

    #[test]
    fn expected_duration_reads_parameters() {
        let mut job = sample_job();
        job.parameters = Json(serde_json::json!({ "duration_seconds": 5.0 }));
        assert_eq!(
            job.expected_duration(),
            Some(std::time::Duration::from_secs(5))
        );

        job.parameters = Json(serde_json::json!({}));
        assert_eq!(job.expected_duration(), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timed_out\"");
    }
}
