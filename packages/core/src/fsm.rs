//! The job state machine and its retry/timeout policies.
//!
//! The FSM is a value: a fixed relation consulted by the store on every
//! transition. It holds no mutable state of its own.

use std::time::Duration;

use crate::job::JobStatus;

/// An attempted transition outside the fixed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The permitted targets from each state. Everything else is rejected.
pub fn allowed_targets(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Pending => &[Queued, Rejected],
        Queued => &[Assigned, Canceled, Rejected],
        Assigned => &[Running, Retrying, Canceled],
        Running => &[Completed, Failed, TimedOut, Retrying, Paused, Canceled],
        Paused => &[Running, Canceled],
        Retrying => &[Queued, Failed],
        TimedOut => &[Retrying, Failed],
        Failed => &[Retrying],
        Completed | Rejected | Canceled => &[],
    }
}

/// Validate a transition against the relation. A same-state transition is
/// valid here; the store treats it as a no-op and skips the history append.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    if from == to {
        return Ok(());
    }
    if allowed_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff policy for re-queueing failed jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry_count + 1`:
    /// `min(initial * multiplier^retry_count, max)`.
    pub fn backoff_for(&self, retry_count: i32) -> Duration {
        let exp = self.multiplier.powi(retry_count.max(0));
        let backoff = self.initial_backoff.as_secs_f64() * exp;
        let capped = backoff.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

// ============================================================================
// Timeout policy
// ============================================================================

/// Computes the per-job execution deadline. Scenario-dependent: FFmpeg gets a
/// proportional margin, GStreamer a fixed one, undeclared durations fall back
/// to the configured default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    /// Applied when the job declares no expected duration.
    pub default_timeout: Duration,
    /// Deadline for an assigned job to start running (stuck assignment).
    pub assigned_timeout: Duration,
    /// Fixed safety margin added to ffmpeg's proportional timeout.
    pub ffmpeg_safety_margin: Duration,
    /// Fixed safety margin added to gstreamer's expected duration.
    pub gstreamer_safety_margin: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30 * 60),
            assigned_timeout: Duration::from_secs(5 * 60),
            ffmpeg_safety_margin: Duration::from_secs(60),
            gstreamer_safety_margin: Duration::from_secs(30),
        }
    }
}

impl TimeoutPolicy {
    /// Execution timeout for a job once it is running.
    pub fn execution_timeout(
        &self,
        engine: crate::job::EngineKind,
        expected_duration: Option<Duration>,
    ) -> Duration {
        use crate::job::EngineKind;
        match (engine, expected_duration) {
            (EngineKind::Ffmpeg, Some(d)) => d.mul_f64(2.0) + self.ffmpeg_safety_margin,
            (EngineKind::Gstreamer, Some(d)) => d + self.gstreamer_safety_margin,
            // Auto resolves at the worker; until then assume the wider margin.
            (EngineKind::Auto, Some(d)) => d.mul_f64(2.0) + self.ffmpeg_safety_margin,
            (_, None) => self.default_timeout,
        }
    }
}

// ============================================================================
// Scheduling order
// ============================================================================

/// Aging: one effective priority level per five minutes of queue age.
pub const AGING_BUCKET: Duration = Duration::from_secs(5 * 60);

/// Aging stops accumulating after this many buckets (one hour), which keeps
/// queue classes strictly separated: queue weight is scaled above the largest
/// possible priority + aging sum.
pub const AGING_CAP: i64 = 12;

/// Effective scheduling score. Queue class dominates outright; within a
/// queue, aging adds one level per bucket so old low-priority jobs overtake
/// fresh high-priority ones instead of starving. Ties break FIFO on
/// created_at, which is the caller's job.
pub fn effective_priority(
    queue: crate::job::QueueClass,
    priority: crate::job::JobPriority,
    age: Duration,
) -> i64 {
    let buckets = (age.as_secs() / AGING_BUCKET.as_secs()) as i64;
    queue.weight() * 16 + priority.weight() + buckets.min(AGING_CAP)
}

// ============================================================================
// Transient failure classification
// ============================================================================

/// Error message fragments deemed recoverable by retry. Anything else is a
/// terminal failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "timeout",
    "temporary failure",
    "network error",
    "broken pipe",
    "connection reset",
    "worker died",
    "stale",
];

/// Whether a failure message matches the transient pattern set.
pub fn is_transient_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EngineKind;
    use crate::job::JobStatus::*;

    #[test]
    fn every_spec_transition_is_allowed() {
        let allowed = [
            (Pending, Queued),
            (Pending, Rejected),
            (Queued, Assigned),
            (Queued, Canceled),
            (Queued, Rejected),
            (Assigned, Running),
            (Assigned, Retrying),
            (Assigned, Canceled),
            (Running, Completed),
            (Running, Failed),
            (Running, TimedOut),
            (Running, Retrying),
            (Running, Paused),
            (Running, Canceled),
            (Paused, Running),
            (Paused, Canceled),
            (Retrying, Queued),
            (Retrying, Failed),
            (TimedOut, Retrying),
            (TimedOut, Failed),
            (Failed, Retrying),
        ];
        for (from, to) in allowed {
            assert!(
                validate_transition(from, to).is_ok(),
                "{from} -> {to} should be allowed"
            );
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let rejected = [
            (Pending, Running),
            (Pending, Assigned),
            (Queued, Running),
            (Queued, Completed),
            (Running, Queued),
            (Completed, Running),
            (Completed, Queued),
            (Canceled, Queued),
            (Rejected, Queued),
            (Paused, Completed),
            (Failed, Queued),
            (Failed, Completed),
        ];
        for (from, to) in rejected {
            let err = validate_transition(from, to).unwrap_err();
            assert_eq!(err.from, from);
            assert_eq!(err.to, to);
        }
    }

    #[test]
    fn same_state_transition_is_valid() {
        assert!(validate_transition(Running, Running).is_ok());
        assert!(validate_transition(Completed, Completed).is_ok());
    }

    #[test]
    fn terminal_states_have_no_targets() {
        assert!(allowed_targets(Completed).is_empty());
        assert!(allowed_targets(Rejected).is_empty());
        assert!(allowed_targets(Canceled).is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(20));
        // 5 * 2^10 = 5120s, capped at 300s.
        assert_eq!(policy.backoff_for(10), Duration::from_secs(300));
    }

    #[test]
    fn ffmpeg_timeout_is_double_plus_margin() {
        let policy = TimeoutPolicy::default();
        let t = policy.execution_timeout(EngineKind::Ffmpeg, Some(Duration::from_secs(100)));
        assert_eq!(t, Duration::from_secs(260));
    }

    #[test]
    fn gstreamer_timeout_adds_thirty_seconds() {
        let policy = TimeoutPolicy::default();
        let t = policy.execution_timeout(EngineKind::Gstreamer, Some(Duration::from_secs(100)));
        assert_eq!(t, Duration::from_secs(130));
    }

    #[test]
    fn undeclared_duration_uses_default() {
        let policy = TimeoutPolicy::default();
        let t = policy.execution_timeout(EngineKind::Ffmpeg, None);
        assert_eq!(t, Duration::from_secs(1800));
    }

    #[test]
    fn high_priority_beats_slightly_aged_low() {
        use crate::job::{JobPriority, QueueClass};
        let high_fresh = effective_priority(
            QueueClass::Default,
            JobPriority::High,
            Duration::from_secs(0),
        );
        let low_aged_5m = effective_priority(
            QueueClass::Default,
            JobPriority::Low,
            Duration::from_secs(5 * 60),
        );
        assert!(high_fresh > low_aged_5m);
    }

    #[test]
    fn aged_low_overtakes_fresh_high_within_a_queue() {
        use crate::job::{JobPriority, QueueClass};
        // Six aging buckets (30 minutes) put a low job above any fresh high.
        let low_aged_30m = effective_priority(
            QueueClass::Default,
            JobPriority::Low,
            Duration::from_secs(30 * 60),
        );
        let high_fresh = effective_priority(
            QueueClass::Default,
            JobPriority::High,
            Duration::from_secs(0),
        );
        assert!(low_aged_30m > high_fresh);
    }

    #[test]
    fn queue_class_dominates_aging() {
        use crate::job::{JobPriority, QueueClass};
        // Even a maximally aged batch job never outranks a fresh live job.
        let batch_ancient = effective_priority(
            QueueClass::Batch,
            JobPriority::High,
            Duration::from_secs(24 * 3600),
        );
        let live_fresh = effective_priority(
            QueueClass::Live,
            JobPriority::Low,
            Duration::from_secs(0),
        );
        assert!(live_fresh > batch_ancient);
    }

    #[test]
    fn transient_patterns_match() {
        assert!(is_transient_failure("Connection refused by peer"));
        assert!(is_transient_failure("read: connection reset"));
        assert!(is_transient_failure("worker node-3 died"));
        assert!(is_transient_failure("operation timeout after 30s"));
        assert!(!is_transient_failure("invalid input file"));
        assert!(!is_transient_failure("unsupported codec parameters"));
    }
}
