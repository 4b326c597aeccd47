//! Store integration tests against a real Postgres.

mod common;

use std::collections::BTreeMap;

use master_core::store::{Admission, NewJob, NodeRegistration, Store};
use transcode_core::error::ApiError;
use transcode_core::fsm::validate_transition;
use transcode_core::job::{
    EngineKind, FailureClass, Job, JobClass, JobPriority, JobStatus, QueueClass, WrapperConstraints,
};
use transcode_core::node::{Node, NodeCapabilities, NodeStatus, NodeType};
use uuid::Uuid;

fn new_job(scenario: &str) -> NewJob {
    NewJob {
        scenario: scenario.to_string(),
        engine: EngineKind::Ffmpeg,
        queue: QueueClass::Default,
        priority: JobPriority::Medium,
        classification: JobClass::Test,
        parameters: serde_json::json!({ "duration_seconds": 5.0 }),
        required_capabilities: vec![],
        wrapper_constraints: WrapperConstraints::default(),
        max_retries: 3,
    }
}

async fn register_cpu_node(store: &Store, tenant_id: Uuid) -> Node {
    let (node, created) = store
        .register_node(
            tenant_id,
            NodeRegistration {
                id: None,
                address: format!("node-{}:9100", Uuid::new_v4()),
                node_type: NodeType::Cpu,
                capabilities: NodeCapabilities {
                    cpu_threads: 8,
                    cpu_model: "test-cpu".into(),
                    has_gpu: false,
                    gpu_type: None,
                    gpu_capabilities: vec![],
                    encoders: vec!["x264".into()],
                },
                ram_bytes: 8 << 30,
                labels: BTreeMap::new(),
            },
        )
        .await
        .expect("node registration failed");
    assert!(created);
    node
}

/// Walk a job through assigned -> running on the given node.
async fn run_job_on(store: &Store, job: &Job, node: &Node) {
    assert!(store
        .assign_job_to_worker(job.id, node.id)
        .await
        .expect("assignment failed"));
    assert!(store
        .transition_job_state(job.id, JobStatus::Running, "worker started encoder")
        .await
        .unwrap());
}

// ============================================================================
// Creation and admission
// ============================================================================

#[tokio::test]
async fn sequence_numbers_are_monotonic_and_gap_free() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;

    let mut sequences = Vec::new();
    for _ in 0..3 {
        let job = store
            .create_job(tenant.id, new_job("1080p30-h264"), Admission::Queued)
            .await
            .unwrap();
        sequences.push(job.sequence_number);
        assert_eq!(job.status, JobStatus::Queued);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn sequences_are_independent_across_tenants() {
    let store = common::test_store().await;
    let tenant_a = common::fresh_tenant(&store).await;
    let tenant_b = common::fresh_tenant(&store).await;

    let a1 = store
        .create_job(tenant_a.id, new_job("a"), Admission::Queued)
        .await
        .unwrap();
    let b1 = store
        .create_job(tenant_b.id, new_job("b"), Admission::Queued)
        .await
        .unwrap();
    let a2 = store
        .create_job(tenant_a.id, new_job("a"), Admission::Queued)
        .await
        .unwrap();

    assert_eq!(a1.sequence_number, 1);
    assert_eq!(b1.sequence_number, 1);
    assert_eq!(a2.sequence_number, 2);
}

#[tokio::test]
async fn quota_blocks_admission_beyond_max_jobs() {
    let store = common::test_store().await;
    let tenant = store
        .create_tenant(
            &format!("small-{}", Uuid::new_v4()),
            "standard",
            transcode_core::tenant::TenantQuotas {
                max_jobs: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .create_job(tenant.id, new_job("first"), Admission::Queued)
        .await
        .unwrap();

    let err = store
        .create_job(tenant.id, new_job("second"), Admission::Queued)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::QuotaExceeded(_)));

    // The rejected insert left no job and no sequence gap behind.
    let jobs = store.get_jobs_by_tenant(tenant.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let next = store
        .transition_job_state(jobs[0].id, JobStatus::Canceled, "cleanup")
        .await
        .unwrap();
    assert!(next);
    let job = store
        .create_job(tenant.id, new_job("third"), Admission::Queued)
        .await
        .unwrap();
    assert_eq!(job.sequence_number, 2);
}

#[tokio::test]
async fn capability_mismatch_rejects_at_admission() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;

    let mut spec = new_job("4K60-nvenc");
    spec.required_capabilities = vec!["nvenc_h265".into()];
    let job = store
        .create_job(
            tenant.id,
            spec,
            Admission::Rejected {
                missing: "nvenc_h265".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Rejected);
    assert_eq!(
        job.failure_classification,
        Some(FailureClass::CapabilityMismatch)
    );
    assert!(job.completed_at.is_some());
    assert!(job.node_id.is_none());
    assert!(job
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("nvenc_h265"));
}

#[tokio::test]
async fn fleet_supports_matches_capability_tags() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    register_cpu_node(&store, tenant.id).await;

    assert!(store.fleet_supports(tenant.id, &[]).await.unwrap());
    assert!(store
        .fleet_supports(tenant.id, &["x264".to_string()])
        .await
        .unwrap());
    assert!(!store
        .fleet_supports(tenant.id, &["nvenc_h265".to_string()])
        .await
        .unwrap());
}

// ============================================================================
// Transitions
// ============================================================================

#[tokio::test]
async fn same_state_transition_is_a_noop() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let job = store
        .create_job(tenant.id, new_job("idem"), Admission::Queued)
        .await
        .unwrap();

    let history_before = job.state_transitions.0.len();
    let changed = store
        .transition_job_state(job.id, JobStatus::Queued, "again")
        .await
        .unwrap();
    assert!(!changed);

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.state_transitions.0.len(), history_before);
}

#[tokio::test]
async fn illegal_transition_is_rejected_with_the_pair() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let job = store
        .create_job(tenant.id, new_job("illegal"), Admission::Queued)
        .await
        .unwrap();

    let err = store
        .transition_job_state(job.id, JobStatus::Completed, "skip the line")
        .await
        .unwrap_err();
    match err {
        ApiError::Conflict(e) => {
            assert_eq!(e.from, JobStatus::Queued);
            assert_eq!(e.to, JobStatus::Completed);
        }
        other => panic!("expected conflict, got {other}"),
    }

    // Nothing was recorded.
    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}

#[tokio::test]
async fn happy_path_walk_has_five_transitions() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    let job = store
        .create_job(tenant.id, new_job("1080p30-h264"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;
    assert!(store
        .complete_job(job.id, JobStatus::Completed, "encoder exited cleanly", None)
        .await
        .unwrap());

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.completed_at >= job.started_at);
    assert!(job.started_at.map(|s| s >= job.created_at).unwrap());

    // created->pending->queued->assigned->running->completed: five entries,
    // a valid walk starting at pending.
    let walk = &job.state_transitions.0;
    assert_eq!(walk.len(), 5);
    assert_eq!(walk[0].from, None);
    assert_eq!(walk[0].to, JobStatus::Pending);
    assert_eq!(walk.last().unwrap().to, JobStatus::Completed);
    for pair in walk.windows(2) {
        assert_eq!(pair[1].from, Some(pair[0].to), "history must chain");
    }
    for t in walk.iter().skip(1) {
        validate_transition(t.from.unwrap(), t.to)
            .expect("history contains an illegal transition");
    }

    // The worker went back to the pool.
    let node = store.get_node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Available);
    assert!(node.current_job_id.is_none());
}

#[tokio::test]
async fn completion_is_idempotent() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("idem-complete"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;

    assert!(store
        .complete_job(job.id, JobStatus::Completed, "done", None)
        .await
        .unwrap());
    // Second report: success, no change, no new history.
    assert!(!store
        .complete_job(job.id, JobStatus::Completed, "done again", None)
        .await
        .unwrap());

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.state_transitions.0.len(), 5);
}

// ============================================================================
// Assignment
// ============================================================================

#[tokio::test]
async fn assignment_binds_job_and_worker_atomically() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("assign"), Admission::Queued)
        .await
        .unwrap();

    assert!(store.assign_job_to_worker(job.id, node.id).await.unwrap());

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(job.node_id, Some(node.id));
    assert!(job.timeout_at.is_some());

    let node = store.get_node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Busy);
    assert_eq!(node.current_job_id, Some(job.id));
}

#[tokio::test]
async fn reassigning_to_the_same_worker_is_a_noop() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("re-assign"), Admission::Queued)
        .await
        .unwrap();

    assert!(store.assign_job_to_worker(job.id, node.id).await.unwrap());
    assert!(!store.assign_job_to_worker(job.id, node.id).await.unwrap());
}

#[tokio::test]
async fn assigning_to_a_different_worker_conflicts() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node_a = register_cpu_node(&store, tenant.id).await;
    let node_b = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("conflict"), Admission::Queued)
        .await
        .unwrap();

    assert!(store.assign_job_to_worker(job.id, node_a.id).await.unwrap());
    let err = store
        .assign_job_to_worker(job.id, node_b.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AssignmentConflict { .. }));
}

#[tokio::test]
async fn a_worker_never_holds_two_jobs() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let first = store
        .create_job(tenant.id, new_job("first"), Admission::Queued)
        .await
        .unwrap();
    let second = store
        .create_job(tenant.id, new_job("second"), Admission::Queued)
        .await
        .unwrap();

    assert!(store.assign_job_to_worker(first.id, node.id).await.unwrap());
    // Busy worker: the claim is declined, not an error.
    assert!(!store
        .assign_job_to_worker(second.id, node.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn polling_claims_and_then_redelivers_the_assignment() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("pull"), Admission::Queued)
        .await
        .unwrap();

    let claimed = store
        .claim_next_job_for_node(node.id)
        .await
        .unwrap()
        .expect("expected a job");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Assigned);

    // The same poll again redelivers the same assignment.
    let redelivered = store
        .claim_next_job_for_node(node.id)
        .await
        .unwrap()
        .expect("expected redelivery");
    assert_eq!(redelivered.id, job.id);
}

#[tokio::test]
async fn polling_respects_capability_requirements() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    let mut spec = new_job("gpu-only");
    spec.required_capabilities = vec!["nvenc_h265".into()];
    store
        .create_job(tenant.id, spec, Admission::Queued)
        .await
        .unwrap();

    // The CPU node cannot take the GPU job.
    assert!(store.claim_next_job_for_node(node.id).await.unwrap().is_none());
}

// ============================================================================
// Failure, retry, recovery
// ============================================================================

#[tokio::test]
async fn transient_failure_schedules_a_retry() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("flaky"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;

    let status = store
        .record_failure(
            job.id,
            "connection reset by peer",
            FailureClass::RuntimeError,
            None,
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Retrying);

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(job.retry_at.is_some());
    assert_eq!(job.failure_classification, Some(FailureClass::RuntimeError));

    // The worker was released for other work.
    let node = store.get_node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Available);
}

#[tokio::test]
async fn non_transient_failure_is_terminal() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("bad-input"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;

    let status = store
        .record_failure(job.id, "invalid input file", FailureClass::UserError, None)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    let mut spec = new_job("always-flaky");
    spec.max_retries = 2;
    let job = store
        .create_job(tenant.id, spec, Admission::Queued)
        .await
        .unwrap();

    for attempt in 0..=2 {
        // Wait out the short test backoff, then re-run the job.
        let mut promoted = false;
        for _ in 0..200 {
            store.promote_due_retries(16).await.unwrap();
            if store.get_job(job.id).await.unwrap().status == JobStatus::Queued {
                promoted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(promoted, "retry promotion did not converge on attempt {attempt}");
        run_job_on(&store, &store.get_job(job.id).await.unwrap(), &node).await;

        let status = store
            .record_failure(
                job.id,
                "network error while reading source",
                FailureClass::RuntimeError,
                None,
            )
            .await
            .unwrap();

        if attempt < 2 {
            assert_eq!(status, JobStatus::Retrying, "attempt {attempt}");
        } else {
            assert_eq!(status, JobStatus::Failed, "attempt {attempt}");
        }
    }

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.failure_classification, Some(FailureClass::RuntimeError));
}

#[tokio::test]
async fn orphaned_jobs_are_detected_and_recovered() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("orphan"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;

    // The worker goes silent.
    sqlx::query("UPDATE nodes SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(node.id)
        .execute(store.pool())
        .await
        .unwrap();

    let orphans = store
        .get_orphaned_jobs(std::time::Duration::from_secs(90))
        .await
        .unwrap();
    assert!(orphans.iter().any(|j| j.id == job.id));

    let reason = format!("worker {} died", node.id);
    let status = store.recover_orphan(job.id, &reason).await.unwrap();
    assert_eq!(status, Some(JobStatus::Retrying));

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(job
        .state_transitions
        .0
        .iter()
        .any(|t| t.reason.contains("died")));
}

#[tokio::test]
async fn stale_nodes_go_offline_once() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    sqlx::query("UPDATE nodes SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(node.id)
        .execute(store.pool())
        .await
        .unwrap();

    let marked = store
        .mark_stale_nodes_offline(std::time::Duration::from_secs(90))
        .await
        .unwrap();
    assert!(marked.contains(&node.id));
    assert_eq!(
        store.get_node(node.id).await.unwrap().status,
        NodeStatus::Offline
    );

    // Second sweep: already offline, not re-marked.
    let marked_again = store
        .mark_stale_nodes_offline(std::time::Duration::from_secs(90))
        .await
        .unwrap();
    assert!(!marked_again.contains(&node.id));
}

#[tokio::test]
async fn running_job_past_deadline_times_out_and_retries() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;
    let job = store
        .create_job(tenant.id, new_job("slow"), Admission::Queued)
        .await
        .unwrap();
    run_job_on(&store, &job, &node).await;

    sqlx::query("UPDATE jobs SET timeout_at = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(job.id)
        .execute(store.pool())
        .await
        .unwrap();

    let overdue = store.get_timed_out_jobs(chrono::Utc::now()).await.unwrap();
    assert!(overdue.iter().any(|j| j.id == job.id));

    let status = store.time_out_job(job.id).await.unwrap();
    assert_eq!(status, Some(JobStatus::Retrying));

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.failure_classification, Some(FailureClass::Timeout));
    assert!(job
        .state_transitions
        .0
        .iter()
        .any(|t| t.to == JobStatus::TimedOut));
}

// ============================================================================
// Nodes and tenants
// ============================================================================

#[tokio::test]
async fn re_registration_updates_in_place() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    let (again, created) = store
        .register_node(
            tenant.id,
            NodeRegistration {
                id: Some(node.id),
                address: node.address.clone(),
                node_type: NodeType::Cpu,
                capabilities: NodeCapabilities {
                    cpu_threads: 16, // upgraded host
                    cpu_model: "test-cpu".into(),
                    has_gpu: false,
                    gpu_type: None,
                    gpu_capabilities: vec![],
                    encoders: vec!["x264".into(), "x265".into()],
                },
                ram_bytes: 16 << 30,
                labels: BTreeMap::new(),
            },
        )
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(again.id, node.id);
    assert_eq!(again.capabilities.cpu_threads, 16);
    assert_eq!(
        store.get_nodes_by_tenant(tenant.id).await.unwrap().len(),
        1,
        "re-registration must not duplicate"
    );
}

#[tokio::test]
async fn heartbeat_reports_drain_when_requested() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    use transcode_core::protocol::DesiredWorkerState;
    assert_eq!(
        store.update_node_heartbeat(node.id).await.unwrap(),
        DesiredWorkerState::Active
    );

    store.request_node_drain(node.id).await.unwrap();
    assert_eq!(
        store.update_node_heartbeat(node.id).await.unwrap(),
        DesiredWorkerState::Drain
    );
}

#[tokio::test]
async fn default_tenant_exists_and_cannot_be_deleted() {
    let store = common::test_store().await;
    let tenant = store.get_tenant_by_name("default").await.unwrap();
    let err = store.delete_tenant(tenant.id).await.unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));
}

#[tokio::test]
async fn tenant_usage_counters_converge_with_stats() {
    let store = common::test_store().await;
    let tenant = common::fresh_tenant(&store).await;
    let node = register_cpu_node(&store, tenant.id).await;

    let job = store
        .create_job(tenant.id, new_job("usage"), Admission::Queued)
        .await
        .unwrap();
    let t = store.get_tenant(tenant.id).await.unwrap();
    assert_eq!(t.active_jobs, 1);
    assert_eq!(t.jobs_this_hour, 1);

    run_job_on(&store, &job, &node).await;
    store
        .complete_job(job.id, JobStatus::Completed, "done", None)
        .await
        .unwrap();

    let t = store.get_tenant(tenant.id).await.unwrap();
    assert_eq!(t.active_jobs, 0);

    let stats = store.get_tenant_stats(tenant.id).await.unwrap();
    assert_eq!(stats.active_jobs, t.active_jobs as i64);
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(stats.active_workers, 1);
}
