//! Local counters derived from result records. These never influence
//! wrapper behavior; they exist for the post-mortem view.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use transcode_core::protocol::{WrapperMode, WrapperResult};

pub const DEFAULT_VIOLATION_RING: usize = 50;

#[derive(Debug, Clone)]
pub struct SlaViolation {
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub platform_sla_compliant: AtomicU64,
    pub platform_sla_violation: AtomicU64,
    pub jobs_run: AtomicU64,
    pub jobs_attach: AtomicU64,
    pub exit_zero: AtomicU64,
    pub exit_nonzero: AtomicU64,
}

pub struct WrapperMetrics {
    pub counters: Counters,
    violations: Mutex<VecDeque<SlaViolation>>,
    ring_capacity: usize,
}

impl WrapperMetrics {
    pub fn new() -> Self {
        Self::with_ring_capacity(DEFAULT_VIOLATION_RING)
    }

    pub fn with_ring_capacity(ring_capacity: usize) -> Self {
        Self {
            counters: Counters::default(),
            violations: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
        }
    }

    pub fn record_start(&self, mode: WrapperMode) {
        self.counters.jobs_started.fetch_add(1, Ordering::Relaxed);
        match mode {
            WrapperMode::Run => self.counters.jobs_run.fetch_add(1, Ordering::Relaxed),
            WrapperMode::Attach => self.counters.jobs_attach.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Fold one finished result into the counters and, when the platform SLA
    /// was violated, the bounded ring.
    pub fn record_result(&self, result: &WrapperResult) {
        self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);

        match result.exit_code {
            Some(0) => self.counters.exit_zero.fetch_add(1, Ordering::Relaxed),
            Some(_) => self.counters.exit_nonzero.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };

        if result.platform_sla_met {
            self.counters
                .platform_sla_compliant
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .platform_sla_violation
                .fetch_add(1, Ordering::Relaxed);

            let mut ring = self.violations.lock().expect("violation ring poisoned");
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(SlaViolation {
                job_id: result.job_id,
                at: result.end_time,
                reason: result.platform_sla_reason.clone(),
            });
        }
    }

    pub fn recent_violations(&self) -> Vec<SlaViolation> {
        self.violations
            .lock()
            .expect("violation ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for WrapperMetrics {
    fn default() -> Self {
        Self::new()
    }
}
