//! Job persistence: admission, the single transition write path, assignment,
//! failure/timeout recording, and the queries the scheduler loops run on.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use transcode_core::error::ApiError;
use transcode_core::fsm::{self, TimeoutPolicy};
use transcode_core::job::{
    EngineKind, FailureClass, Job, JobClass, JobPriority, JobStatus, QueueClass, StateTransition,
    WrapperConstraints,
};
use transcode_core::protocol::WrapperResult;

use super::Store;

pub(crate) const JOB_COLUMNS: &str = "id, tenant_id, sequence_number, scenario, engine, queue, priority, classification, \
     status, node_id, parameters, required_capabilities, wrapper_constraints, \
     retry_count, max_retries, retry_at, failure_reason, failure_classification, \
     state_transitions, result_metadata, created_at, started_at, completed_at, \
     last_activity_at, timeout_at";

/// Everything the API needs to persist a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub scenario: String,
    pub engine: EngineKind,
    pub queue: QueueClass,
    pub priority: JobPriority,
    pub classification: JobClass,
    pub parameters: serde_json::Value,
    pub required_capabilities: Vec<String>,
    pub wrapper_constraints: WrapperConstraints,
    pub max_retries: i32,
}

/// Outcome of the admission checks run before insert.
#[derive(Debug, Clone)]
pub enum Admission {
    Queued,
    /// The fleet cannot satisfy a required capability.
    Rejected { missing: String },
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub queue: Option<QueueClass>,
    pub node_id: Option<Uuid>,
    pub limit: Option<i64>,
}

fn deadline(now: DateTime<Utc>, after: std::time::Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

impl Store {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Insert a job with an atomically allocated per-tenant sequence number.
    /// The quota check, counter bump, insert, and initial transition share
    /// one transaction; a quota rejection leaves nothing behind.
    pub async fn create_job(
        &self,
        tenant_id: Uuid,
        new: NewJob,
        admission: Admission,
    ) -> Result<Job, ApiError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let mut tenant = super::tenants::lock_tenant(&mut tx, tenant_id).await?;

        if tenant.hour_window_lapsed(now) {
            sqlx::query(
                "UPDATE tenants SET jobs_this_hour = 0, hour_window_start = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(tenant_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tenant.jobs_this_hour = 0;
            tenant.hour_window_start = now;
        }

        tenant.admit_job(now)?;

        let sequence_number: i64 = sqlx::query_scalar(
            "UPDATE tenant_sequences SET value = value + 1 WHERE tenant_id = $1 RETURNING value",
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;

        let birth = vec![StateTransition {
            from: None,
            to: JobStatus::Pending,
            timestamp: now,
            reason: "created".to_string(),
        }];

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, sequence_number, scenario, engine, queue, priority,
                classification, status, parameters, required_capabilities,
                wrapper_constraints, max_retries, created_at, last_activity_at,
                state_transitions
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, $11, $12, $13, $13, $14)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(sequence_number)
        .bind(&new.scenario)
        .bind(new.engine)
        .bind(new.queue)
        .bind(new.priority)
        .bind(new.classification)
        .bind(Json(&new.parameters))
        .bind(&new.required_capabilities)
        .bind(Json(&new.wrapper_constraints))
        .bind(new.max_retries)
        .bind(now)
        .bind(Json(&birth))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tenants SET active_jobs = active_jobs + 1, jobs_this_hour = jobs_this_hour + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        let job = match admission {
            Admission::Queued => {
                apply_transition(&mut tx, &job, JobStatus::Queued, "admitted", self.timeout_policy(), None).await?
            }
            Admission::Rejected { missing } => {
                let reason = format!("no worker in the fleet provides capability {missing}");
                sqlx::query(
                    "UPDATE jobs SET failure_reason = $2, failure_classification = $3 WHERE id = $1",
                )
                .bind(job.id)
                .bind(&reason)
                .bind(FailureClass::CapabilityMismatch)
                .execute(&mut *tx)
                .await?;
                apply_transition(&mut tx, &job, JobStatus::Rejected, &reason, self.timeout_policy(), None).await?
            }
        };

        tx.commit().await?;
        Ok(job)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_job(&self, id: Uuid) -> Result<Job, ApiError> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, ApiError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::job_status IS NULL OR status = $2)
              AND ($3::job_queue IS NULL OR queue = $3)
              AND ($4::uuid IS NULL OR node_id = $4)
            ORDER BY created_at DESC
            LIMIT $5
            "#
        ))
        .bind(filter.tenant_id)
        .bind(filter.status)
        .bind(filter.queue)
        .bind(filter.node_id)
        .bind(filter.limit.unwrap_or(100).clamp(1, 1000))
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    pub async fn get_jobs_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Job>, ApiError> {
        self.list_jobs(JobFilter {
            tenant_id: Some(tenant_id),
            ..Default::default()
        })
        .await
    }

    /// Depth of the assignable backlog (queued plus due retries).
    pub async fn queue_depth(&self) -> Result<i64, ApiError> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued' OR (status = 'retrying' AND retry_at <= NOW())",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(depth)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Validated, logged state transition. Returns false (without touching
    /// history) when the job is already in the target state.
    pub async fn transition_job_state(
        &self,
        job_id: Uuid,
        to: JobStatus,
        reason: &str,
    ) -> Result<bool, ApiError> {
        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        if job.status == to {
            tx.commit().await?;
            return Ok(false);
        }

        apply_transition(&mut tx, &job, to, reason, self.timeout_policy(), None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Idempotent terminal transition with the wrapper result attached.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        terminal: JobStatus,
        reason: &str,
        result: Option<&WrapperResult>,
    ) -> Result<bool, ApiError> {
        if !terminal.is_terminal() {
            return Err(ApiError::Validation(format!(
                "{terminal} is not a terminal state"
            )));
        }

        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        if job.status == terminal {
            tx.commit().await?;
            return Ok(false);
        }

        if let Some(result) = result {
            sqlx::query("UPDATE jobs SET result_metadata = $2 WHERE id = $1")
                .bind(job_id)
                .bind(Json(serde_json::to_value(result).map_err(|e| {
                    ApiError::Internal(format!("serialize result: {e}"))
                })?))
                .execute(&mut *tx)
                .await?;
        }

        apply_transition(&mut tx, &job, terminal, reason, self.timeout_policy(), None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Record a failure and drive the retry decision in one transaction.
    /// Returns the job's final status (failed, or retrying when another
    /// attempt was scheduled). Reporting an already-terminal job is a no-op.
    pub async fn record_failure(
        &self,
        job_id: Uuid,
        reason: &str,
        class: FailureClass,
        result: Option<&WrapperResult>,
    ) -> Result<JobStatus, ApiError> {
        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        // Re-reported outcomes are a no-op: the job already settled (or a
        // retry is already scheduled for this failure).
        if job.status.is_terminal() || job.status == JobStatus::Retrying {
            tx.commit().await?;
            return Ok(job.status);
        }

        sqlx::query(
            "UPDATE jobs SET failure_reason = $2, failure_classification = $3, result_metadata = COALESCE($4, result_metadata) WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .bind(class)
        .bind(result.and_then(|r| serde_json::to_value(r).ok().map(Json)))
        .execute(&mut *tx)
        .await?;

        let failed =
            apply_transition(&mut tx, &job, JobStatus::Failed, reason, self.timeout_policy(), None)
                .await?;

        let retryable = class.retry_eligible()
            && fsm::is_transient_failure(reason)
            && failed.retries_remaining();

        let final_status = if retryable {
            let retried = self.schedule_retry_in_tx(&mut tx, &failed, reason).await?;
            retried.status
        } else {
            JobStatus::Failed
        };

        tx.commit().await?;
        Ok(final_status)
    }

    /// Time out an overdue job. Running jobs walk through timed_out and then
    /// retry or fail; stuck assignments go straight back to retrying.
    pub async fn time_out_job(&self, job_id: Uuid) -> Result<Option<JobStatus>, ApiError> {
        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        let final_status = match job.status {
            JobStatus::Running => {
                let reason = "execution timeout exceeded";
                sqlx::query(
                    "UPDATE jobs SET failure_reason = $2, failure_classification = $3 WHERE id = $1",
                )
                .bind(job_id)
                .bind(reason)
                .bind(FailureClass::Timeout)
                .execute(&mut *tx)
                .await?;

                let timed_out = apply_transition(
                    &mut tx,
                    &job,
                    JobStatus::TimedOut,
                    reason,
                    self.timeout_policy(),
                    None,
                )
                .await?;

                if timed_out.retries_remaining() {
                    let retried = self.schedule_retry_in_tx(&mut tx, &timed_out, reason).await?;
                    Some(retried.status)
                } else {
                    let failed = apply_transition(
                        &mut tx,
                        &timed_out,
                        JobStatus::Failed,
                        "max retries exceeded",
                        self.timeout_policy(),
                        None,
                    )
                    .await?;
                    Some(failed.status)
                }
            }
            JobStatus::Assigned => {
                // Never progressed to running within the assignment window.
                let reason = format!(
                    "assignment to worker {} stalled past {}s",
                    job.node_id.map(|id| id.to_string()).unwrap_or_default(),
                    self.timeout_policy().assigned_timeout.as_secs(),
                );
                let next = self.retry_or_fail_in_tx(&mut tx, &job, &reason).await?;
                Some(next)
            }
            _ => {
                debug!(job_id = %job_id, status = %job.status, "timeout sweep raced a transition, skipping");
                None
            }
        };

        tx.commit().await?;
        Ok(final_status)
    }

    /// Recover a job whose worker went away. Increments retry_count and
    /// schedules the backoff, or fails the job when attempts are exhausted.
    pub async fn recover_orphan(&self, job_id: Uuid, reason: &str) -> Result<Option<JobStatus>, ApiError> {
        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        if !matches!(job.status, JobStatus::Assigned | JobStatus::Running) {
            tx.commit().await?;
            return Ok(None);
        }

        let status = self.retry_or_fail_in_tx(&mut tx, &job, reason).await?;
        tx.commit().await?;
        Ok(Some(status))
    }

    /// Move due retrying jobs back to queued. Bounded batch, skip-locked so
    /// concurrent sweeps never double-handle a row.
    pub async fn promote_due_retries(&self, limit: i64) -> Result<Vec<Job>, ApiError> {
        let mut tx = self.pool().begin().await?;
        let due = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'retrying' AND retry_at <= NOW()
            ORDER BY retry_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut promoted = Vec::with_capacity(due.len());
        for job in &due {
            let queued = apply_transition(
                &mut tx,
                job,
                JobStatus::Queued,
                "retry backoff elapsed",
                self.timeout_policy(),
                None,
            )
            .await?;
            promoted.push(queued);
        }

        tx.commit().await?;
        Ok(promoted)
    }

    /// Safety sweep: any retrying job whose budget is spent goes to failed.
    pub async fn fail_exhausted_retries(&self) -> Result<u64, ApiError> {
        let exhausted = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'retrying' AND retry_count >= max_retries
            "#
        ))
        .fetch_all(self.pool())
        .await?;

        let mut failed = 0;
        for job in exhausted {
            let mut tx = self.pool().begin().await?;
            let job = lock_job(&mut tx, job.id).await?;
            if job.status == JobStatus::Retrying && job.retry_count >= job.max_retries {
                apply_transition(
                    &mut tx,
                    &job,
                    JobStatus::Failed,
                    "max retries exceeded",
                    self.timeout_policy(),
                    None,
                )
                .await?;
                failed += 1;
            }
            tx.commit().await?;
        }
        Ok(failed)
    }

    /// Refresh last_activity_at. Safe in any state.
    pub async fn update_job_heartbeat(&self, job_id: Uuid) -> Result<(), ApiError> {
        let updated = sqlx::query("UPDATE jobs SET last_activity_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ApiError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Atomically bind a queued (or due-retrying) job to a specific worker.
    /// Returns false when the job is already on that worker or the worker is
    /// no longer eligible; errors when the job belongs to a different worker.
    pub async fn assign_job_to_worker(
        &self,
        job_id: Uuid,
        node_id: Uuid,
    ) -> Result<bool, ApiError> {
        let mut tx = self.pool().begin().await?;
        let job = lock_job(&mut tx, job_id).await?;

        match job.status {
            JobStatus::Assigned if job.node_id == Some(node_id) => {
                tx.commit().await?;
                return Ok(false);
            }
            JobStatus::Assigned | JobStatus::Running | JobStatus::Paused => {
                return Err(ApiError::AssignmentConflict { job_id });
            }
            JobStatus::Queued => {}
            JobStatus::Retrying => {
                let due = job.retry_at.map(|t| t <= Utc::now()).unwrap_or(true);
                if !due {
                    tx.commit().await?;
                    return Ok(false);
                }
            }
            _ => {
                return Err(ApiError::Conflict(fsm::TransitionError {
                    from: job.status,
                    to: JobStatus::Assigned,
                }));
            }
        }

        let node = super::nodes::lock_node(&mut tx, node_id).await?;
        if node.status != transcode_core::node::NodeStatus::Available
            || node.current_job_id.is_some()
            || node.tenant_id != job.tenant_id
        {
            tx.commit().await?;
            return Ok(false);
        }
        if !job.runnable_on(&node.capabilities.all_tags()) {
            tx.commit().await?;
            return Ok(false);
        }

        assign_in_tx(&mut tx, &job, &node, self.timeout_policy()).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Pull-side claim: hand a polling worker its next job. Prefers a job
    /// already assigned to the node, then claims the best eligible backlog
    /// job under lock.
    pub async fn claim_next_job_for_node(&self, node_id: Uuid) -> Result<Option<Job>, ApiError> {
        let mut tx = self.pool().begin().await?;
        let node = super::nodes::lock_node(&mut tx, node_id).await?;

        // Deliver a scheduler-made assignment first.
        let pending_delivery = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE node_id = $1 AND status = 'assigned' LIMIT 1",
        ))
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(job) = pending_delivery {
            tx.commit().await?;
            return Ok(Some(job));
        }

        if node.status != transcode_core::node::NodeStatus::Available
            || node.current_job_id.is_some()
        {
            tx.commit().await?;
            return Ok(None);
        }

        let tags = node.capabilities.all_tags();
        let candidates = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = $1
              AND (status = 'queued' OR (status = 'retrying' AND retry_at <= NOW()))
              AND required_capabilities <@ $2::text[]
            ORDER BY created_at ASC
            LIMIT 32
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(node.tenant_id)
        .bind(&tags)
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        let best = candidates.into_iter().max_by(|a, b| {
            let score_a = job_score(a, now);
            let score_b = job_score(b, now);
            // Higher score wins; FIFO (older first) breaks ties.
            score_a
                .cmp(&score_b)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let Some(job) = best else {
            tx.commit().await?;
            return Ok(None);
        };

        let assigned = assign_in_tx(&mut tx, &job, &node, self.timeout_policy()).await?;
        tx.commit().await?;
        Ok(Some(assigned))
    }

    /// Backlog window for the assignment loop, oldest first. Final ordering
    /// by effective priority happens in the scheduler.
    pub async fn get_assignment_candidates(&self, window: i64) -> Result<Vec<Job>, ApiError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'queued' OR (status = 'retrying' AND retry_at <= NOW())
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(window)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    // ========================================================================
    // Failure-detection queries
    // ========================================================================

    /// Jobs in {assigned, running} whose worker has stopped heartbeating or
    /// gone offline.
    pub async fn get_orphaned_jobs(
        &self,
        worker_timeout: std::time::Duration,
    ) -> Result<Vec<Job>, ApiError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {cols} FROM jobs j
            JOIN nodes n ON j.node_id = n.id
            WHERE j.status IN ('assigned', 'running')
              AND (n.last_heartbeat < NOW() - ($1 || ' seconds')::INTERVAL OR n.status = 'offline')
            "#,
            cols = JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        ))
        .bind(worker_timeout.as_secs().to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Jobs whose computed deadline has passed.
    pub async fn get_timed_out_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, ApiError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('assigned', 'running') AND timeout_at < $1
            "#
        ))
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// failed/timed_out -> retrying with the backoff scheduled.
    async fn schedule_retry_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        reason: &str,
    ) -> Result<Job, ApiError> {
        let backoff = self.retry_policy().backoff_for(job.retry_count);
        let retry_at = deadline(Utc::now(), backoff);
        sqlx::query("UPDATE jobs SET retry_count = retry_count + 1, retry_at = $2 WHERE id = $1")
            .bind(job.id)
            .bind(retry_at)
            .execute(&mut **tx)
            .await?;

        let mut bumped = job.clone();
        bumped.retry_count += 1;
        bumped.retry_at = Some(retry_at);
        apply_transition(tx, &bumped, JobStatus::Retrying, reason, self.timeout_policy(), None)
            .await
    }

    /// assigned/running -> retrying when attempts remain, else -> failed
    /// (walking through the states the relation requires).
    async fn retry_or_fail_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        reason: &str,
    ) -> Result<JobStatus, ApiError> {
        if job.retries_remaining() {
            let retried = self.schedule_retry_in_tx(tx, job, reason).await?;
            Ok(retried.status)
        } else {
            // Out of budget. assigned has no direct path to failed, so pass
            // through retrying without scheduling another attempt.
            let retrying = apply_transition(
                tx,
                job,
                JobStatus::Retrying,
                reason,
                self.timeout_policy(),
                None,
            )
            .await?;
            let failed = apply_transition(
                tx,
                &retrying,
                JobStatus::Failed,
                "max retries exceeded",
                self.timeout_policy(),
                None,
            )
            .await?;
            Ok(failed.status)
        }
    }
}

fn job_score(job: &Job, now: DateTime<Utc>) -> i64 {
    let age = now
        .signed_duration_since(job.created_at)
        .to_std()
        .unwrap_or_default();
    fsm::effective_priority(job.queue, job.priority, age)
}

pub(crate) async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
) -> Result<Job, ApiError> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE",
    ))
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
}

/// The single write path for status changes. Validates against the FSM,
/// appends to the transition log, stamps timestamps and the timeout deadline,
/// releases the node and settles tenant usage when the job leaves the
/// node-holding or enters a terminal state.
pub(crate) async fn apply_transition(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    to: JobStatus,
    reason: &str,
    timeouts: &TimeoutPolicy,
    assign_node: Option<Uuid>,
) -> Result<Job, ApiError> {
    if job.status == to {
        return Ok(job.clone());
    }
    fsm::validate_transition(job.status, to)?;

    let now = Utc::now();
    let timeout_at = match to {
        JobStatus::Assigned => Some(deadline(now, timeouts.assigned_timeout)),
        JobStatus::Running => Some(deadline(
            now,
            timeouts.execution_timeout(job.engine, job.expected_duration()),
        )),
        _ => None,
    };

    let node_id = if to.holds_node() {
        assign_node.or(job.node_id)
    } else {
        None
    };

    let started_at = if to == JobStatus::Running {
        job.started_at.or(Some(now))
    } else {
        job.started_at
    };
    // completed_at is set iff the job sits in a terminal state; a retry that
    // revives a failed job clears it again.
    let completed_at = if to.is_terminal() {
        job.completed_at.or(Some(now))
    } else if job.status.is_terminal() {
        None
    } else {
        job.completed_at
    };
    let retry_at = if to == JobStatus::Queued {
        None
    } else {
        job.retry_at
    };

    let mut transitions = job.state_transitions.0.clone();
    transitions.push(StateTransition {
        from: Some(job.status),
        to,
        timestamp: now,
        reason: reason.to_string(),
    });

    let updated = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE jobs SET
            status = $2,
            node_id = $3,
            started_at = $4,
            completed_at = $5,
            last_activity_at = $6,
            timeout_at = $7,
            retry_at = $8,
            state_transitions = $9
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.id)
    .bind(to)
    .bind(node_id)
    .bind(started_at)
    .bind(completed_at)
    .bind(now)
    .bind(timeout_at)
    .bind(retry_at)
    .bind(Json(&transitions))
    .fetch_one(&mut **tx)
    .await?;

    // Leaving the node: hand the worker back to the pool unless the health
    // loop already took it offline.
    if job.status.holds_node() && !to.holds_node() {
        if let Some(node_id) = job.node_id {
            sqlx::query(
                r#"
                UPDATE nodes SET
                    current_job_id = NULL,
                    status = CASE WHEN status = 'busy' THEN 'available' ELSE status END,
                    updated_at = NOW()
                WHERE id = $1 AND current_job_id = $2
                "#,
            )
            .bind(node_id)
            .bind(job.id)
            .execute(&mut **tx)
            .await?;
        }
    }

    // Terminal entry settles the tenant's active count; the failed->retrying
    // revival takes the slot back.
    if to.is_terminal() && !job.status.is_terminal() {
        sqlx::query(
            "UPDATE tenants SET active_jobs = GREATEST(active_jobs - 1, 0), updated_at = NOW() WHERE id = $1",
        )
        .bind(job.tenant_id)
        .execute(&mut **tx)
        .await?;
    } else if !to.is_terminal() && job.status.is_terminal() {
        sqlx::query(
            "UPDATE tenants SET active_jobs = active_jobs + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(job.tenant_id)
        .execute(&mut **tx)
        .await?;
    }

    debug!(
        job_id = %job.id,
        from = %job.status,
        to = %to,
        reason = %reason,
        "job transition"
    );

    Ok(updated)
}

/// queued/retrying -> assigned bound to `node`, inside the caller's
/// transaction with both rows locked.
pub(crate) async fn assign_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    node: &transcode_core::node::Node,
    timeouts: &TimeoutPolicy,
) -> Result<Job, ApiError> {
    // A due retrying job passes through queued so its history stays a valid
    // walk of the relation.
    let job = if job.status == JobStatus::Retrying {
        apply_transition(tx, job, JobStatus::Queued, "retry backoff elapsed", timeouts, None)
            .await?
    } else {
        job.clone()
    };

    let assigned = apply_transition(
        tx,
        &job,
        JobStatus::Assigned,
        &format!("assigned to worker {}", node.id),
        timeouts,
        Some(node.id),
    )
    .await?;

    sqlx::query(
        r#"
        UPDATE nodes SET
            status = 'busy',
            current_job_id = $2,
            last_assigned_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(node.id)
    .bind(assigned.id)
    .execute(&mut **tx)
    .await?;

    Ok(assigned)
}
