//! Prometheus metrics for the master. Gauges and counters only; nothing in
//! here drives behavior.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    pub queue_depth: IntGauge,
    pub assignment_attempts: IntCounter,
    pub assignments: IntCounter,
    pub assignment_failures: IntCounter,
    pub orphans_recovered: IntCounter,
    pub retries_scheduled: IntCounter,
    pub timeouts_detected: IntCounter,
    pub workers_marked_offline: IntCounter,
    pub jobs_created: IntCounter,
    pub jobs_rejected: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub results_reported: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queue_depth = IntGauge::new("scheduler_queue_depth", "Assignable backlog size")?;
        let assignment_attempts = IntCounter::new(
            "scheduler_assignment_attempts_total",
            "Assignment attempts across all cycles",
        )?;
        let assignments = IntCounter::new(
            "scheduler_assignments_total",
            "Jobs successfully bound to a worker",
        )?;
        let assignment_failures = IntCounter::new(
            "scheduler_assignment_failures_total",
            "Assignment attempts that hit a conflict or error",
        )?;
        let orphans_recovered = IntCounter::new(
            "scheduler_orphans_recovered_total",
            "Jobs recovered from dead workers",
        )?;
        let retries_scheduled = IntCounter::new(
            "scheduler_retries_scheduled_total",
            "Jobs promoted from retrying back to queued",
        )?;
        let timeouts_detected = IntCounter::new(
            "scheduler_timeouts_detected_total",
            "Jobs that exceeded their computed deadline",
        )?;
        let workers_marked_offline = IntCounter::new(
            "scheduler_workers_marked_offline_total",
            "Nodes flipped to offline by the health loop",
        )?;
        let jobs_created = IntCounter::new("jobs_created_total", "Jobs accepted by the API")?;
        let jobs_rejected = IntCounter::new(
            "jobs_rejected_total",
            "Jobs rejected at admission (capability mismatch)",
        )?;
        let jobs_completed = IntCounter::new("jobs_completed_total", "Jobs finished successfully")?;
        let jobs_failed =
            IntCounter::new("jobs_failed_total", "Jobs that reached the failed state")?;
        let results_reported =
            IntCounter::new("results_reported_total", "Wrapper results received")?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(assignment_attempts.clone()))?;
        registry.register(Box::new(assignments.clone()))?;
        registry.register(Box::new(assignment_failures.clone()))?;
        registry.register(Box::new(orphans_recovered.clone()))?;
        registry.register(Box::new(retries_scheduled.clone()))?;
        registry.register(Box::new(timeouts_detected.clone()))?;
        registry.register(Box::new(workers_marked_offline.clone()))?;
        registry.register(Box::new(jobs_created.clone()))?;
        registry.register(Box::new(jobs_rejected.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(results_reported.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            assignment_attempts,
            assignments,
            assignment_failures,
            orphans_recovered,
            retries_scheduled,
            timeouts_detected,
            workers_marked_offline,
            jobs_created,
            jobs_rejected,
            jobs_completed,
            jobs_failed,
            results_reported,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_renders() {
        let metrics = Metrics::new().unwrap();
        metrics.jobs_created.inc();
        metrics.queue_depth.set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("jobs_created_total 1"));
        assert!(text.contains("scheduler_queue_depth 3"));
    }

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.assignments.get(), 0);
        assert_eq!(metrics.orphans_recovered.get(), 0);
    }
}
