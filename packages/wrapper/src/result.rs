//! Post-mortem record construction.
//!
//! The platform outcome and the workload outcome are separate: the record
//! says whether the wrapper did its job regardless of whether the encoder
//! did. The record is constructed exactly once per supervised workload and
//! never mutated afterwards.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use transcode_core::protocol::{WrapperMode, WrapperResult};

/// How the supervision episode ended, from the wrapper's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformOutcome {
    /// The wrapper observed the workload to its natural exit.
    ObservedExit,
    /// Same, but one or more cgroup limits could not be applied.
    ObservedExitDegraded(Vec<String>),
    /// The wrapper had to stop supervising before the workload exited
    /// (attach target vanished from under us mid-poll, for example).
    SupervisionInterrupted(String),
}

pub fn build_result(
    job_id: Uuid,
    pid: u32,
    mode: WrapperMode,
    intent: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    exit_code: Option<i32>,
    outcome: PlatformOutcome,
) -> WrapperResult {
    let (platform_sla_met, platform_sla_reason) = match &outcome {
        PlatformOutcome::ObservedExit => match exit_code {
            Some(0) => (true, "workload_completed".to_string()),
            Some(_) => (true, "workload_failed_platform_ok".to_string()),
            None => (true, "workload_signaled_platform_ok".to_string()),
        },
        PlatformOutcome::ObservedExitDegraded(degradations) => (
            true,
            format!("governance_degraded: {}", degradations.join("; ")),
        ),
        PlatformOutcome::SupervisionInterrupted(why) => {
            (false, format!("supervision_interrupted: {why}"))
        }
    };

    let duration_ms = end_time
        .signed_duration_since(start_time)
        .num_milliseconds()
        .max(0) as u64;

    WrapperResult {
        job_id,
        pid,
        mode,
        start_time,
        end_time,
        duration_ms,
        exit_code,
        platform_sla_met,
        platform_sla_reason,
        intent,
    }
}
