//! The long-lived agent loop: register, heartbeat, poll, execute, report.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use transcode_core::config::AgentConfig;
use transcode_core::job::{EngineKind, FailureClass, Job};
use transcode_core::protocol::{
    DesiredWorkerState, RegisterNodeRequest, ResultReport, WrapperMode, WrapperResult,
};
use transcode_wrapper::{Supervisor, WorkloadSpec};

use crate::capabilities::HostProfile;
use crate::client::MasterClient;
use crate::engine::{select_engine, Engine, FfmpegEngine, GstreamerEngine};

/// Agent lifecycle: unregistered -> registering -> active <-> draining -> stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registering,
    Active,
    Draining,
    Stopped,
}

pub struct Agent {
    client: Arc<MasterClient>,
    config: AgentConfig,
    supervisor: Arc<Supervisor>,
    profile: HostProfile,
    available_engines: Vec<EngineKind>,
    node_id: RwLock<Option<Uuid>>,
    state: RwLock<AgentState>,
    slots: Arc<Semaphore>,
    running: Arc<RwLock<HashSet<Uuid>>>,
    /// Unix seconds of the last successful master exchange, shared with the
    /// readiness endpoint.
    last_master_contact: Arc<AtomicU64>,
}

impl Agent {
    pub fn new(
        client: Arc<MasterClient>,
        config: AgentConfig,
        supervisor: Arc<Supervisor>,
        profile: HostProfile,
    ) -> Self {
        let mut available_engines = Vec::new();
        if FfmpegEngine.probe() {
            available_engines.push(EngineKind::Ffmpeg);
        }
        if GstreamerEngine.probe() {
            available_engines.push(EngineKind::Gstreamer);
        }

        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            client,
            config,
            supervisor,
            profile,
            available_engines,
            node_id: RwLock::new(None),
            state: RwLock::new(AgentState::Unregistered),
            slots,
            running: Arc::new(RwLock::new(HashSet::new())),
            last_master_contact: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn last_master_contact(&self) -> Arc<AtomicU64> {
        self.last_master_contact.clone()
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Run until the shutdown token fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let node_id = self.register(&shutdown).await?;
        *self.state.write().await = AgentState::Active;
        info!(node_id = %node_id, "agent active");

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_handle = tokio::spawn(Self::heartbeat_loop(
            self.clone(),
            node_id,
            heartbeat_cancel.clone(),
        ));

        Self::poll_loop(&self, node_id, &shutdown).await;

        // Stopped accepting work; let what is running finish naturally. The
        // encoders are never signaled, whatever the clock says.
        *self.state.write().await = AgentState::Draining;
        let drained = self.wait_for_drain(self.config.shutdown_grace).await;
        if !drained {
            let still_running = self.running.read().await.len();
            warn!(
                count = still_running,
                grace_secs = self.config.shutdown_grace.as_secs(),
                "shutdown grace expired with workloads still running; leaving them to finish"
            );
        }

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;
        *self.state.write().await = AgentState::Stopped;
        info!(node_id = %node_id, "agent stopped");
        Ok(())
    }

    /// Register with the master, retrying until it answers or shutdown.
    async fn register(&self, shutdown: &CancellationToken) -> anyhow::Result<Uuid> {
        *self.state.write().await = AgentState::Registering;
        let request = RegisterNodeRequest {
            id: *self.node_id.read().await,
            address: self.config.advertise_address.clone(),
            node_type: self.profile.node_type,
            capabilities: self.profile.capabilities.clone(),
            ram_bytes: self.profile.ram_bytes,
            labels: self.profile.labels.clone(),
        };

        loop {
            if shutdown.is_cancelled() {
                anyhow::bail!("shutdown before registration completed");
            }
            match self.client.register(&request, shutdown).await {
                Ok(response) => {
                    self.touch_master_contact();
                    *self.node_id.write().await = Some(response.node_id);
                    info!(
                        node_id = %response.node_id,
                        created = response.created,
                        "registered with master"
                    );
                    return Ok(response.node_id);
                }
                Err(e) => {
                    error!(error = %e, "registration failed, retrying in 5s");
                    tokio::select! {
                        _ = shutdown.cancelled() => anyhow::bail!("shutdown before registration completed"),
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, node_id: Uuid, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await; // skip the immediate tick; registration just ran

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let running: Vec<Uuid> = self.running.read().await.iter().copied().collect();
                    match self.client.heartbeat(node_id, running, &cancel).await {
                        Ok(response) => {
                            self.touch_master_contact();
                            if response.desired_state == DesiredWorkerState::Drain {
                                let mut state = self.state.write().await;
                                if *state == AgentState::Active {
                                    info!("master requested drain");
                                    *state = AgentState::Draining;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }

    async fn poll_loop(agent: &Arc<Self>, node_id: Uuid, shutdown: &CancellationToken) {
        loop {
            if shutdown.is_cancelled() || agent.state().await != AgentState::Active {
                break;
            }

            // A slot first, so a poll never claims a job it cannot start.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = agent.slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match agent.client.next_job(node_id, shutdown).await {
                Ok(Some(job)) => {
                    agent.touch_master_contact();
                    // The master redelivers an assignment until it sees the
                    // job running; don't execute what is already in flight.
                    if agent.running.read().await.contains(&job.id) {
                        drop(permit);
                    } else {
                        info!(job_id = %job.id, scenario = %job.scenario, "job received");
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            agent.execute_job(job, permit).await;
                        });
                        continue; // poll again immediately; more slots may be free
                    }
                }
                Ok(None) => {
                    agent.touch_master_contact();
                    drop(permit);
                }
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    drop(permit);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(agent.config.poll_interval) => {}
            }
        }
    }

    /// Execute one job through the wrapper and deliver the result. Result
    /// delivery uses its own token so a shutdown mid-encode cannot abort the
    /// final report.
    async fn execute_job(self: Arc<Self>, job: Job, _permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        self.running.write().await.insert(job_id);
        let delivery = CancellationToken::new();

        if let Err(e) = self.client.start_job(job_id, &delivery).await {
            // Canceled or reassigned between poll and start; let it go.
            warn!(job_id = %job_id, error = %e, "could not mark job running");
            self.running.write().await.remove(&job_id);
            return;
        }

        // Periodic per-job activity refresh while the encoder runs.
        let heartbeat_cancel = delivery.child_token();
        let heartbeat_client = self.client.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat_client.job_heartbeat(job_id, &heartbeat_cancel).await {
                            warn!(job_id = %job_id, error = %e, "job heartbeat failed");
                        }
                    }
                }
            }
        });

        let report = self.run_workload(&job).await;

        heartbeat_handle.abort();
        if let Err(e) = self.client.report_result(&report, &delivery).await {
            error!(job_id = %job_id, error = %e, "failed to deliver result");
        } else {
            self.touch_master_contact();
        }

        self.running.write().await.remove(&job_id);
    }

    async fn run_workload(&self, job: &Job) -> ResultReport {
        let node_id = self
            .node_id
            .try_read()
            .ok()
            .and_then(|id| *id)
            .unwrap_or_default();

        let engine_kind = select_engine(job, &self.available_engines);
        let engine: Box<dyn Engine> = match engine_kind {
            EngineKind::Gstreamer => Box::new(GstreamerEngine),
            _ => Box::new(FfmpegEngine),
        };

        let argv = match engine.build_command(job, &self.config.scratch_dir) {
            Ok(argv) => argv,
            Err(e) => {
                // Never reached the wrapper; the parameters are at fault.
                return ResultReport {
                    node_id,
                    result: unstarted_result(job.id, &e.to_string()),
                    failure_reason: Some(format!("invalid job parameters: {e}")),
                    failure_classification: Some(FailureClass::UserError),
                };
            }
        };

        match self
            .supervisor
            .run(WorkloadSpec {
                job_id: job.id,
                argv,
                cwd: Some(self.config.scratch_dir.clone()),
                constraints: job.wrapper_constraints.0.clone(),
            })
            .await
        {
            Ok(result) => {
                let (failure_reason, failure_classification) = match result.exit_code {
                    Some(0) => (None, None),
                    Some(code) => (
                        Some(format!("encoder exited with code {code}")),
                        Some(FailureClass::RuntimeError),
                    ),
                    None => (
                        Some("encoder terminated by signal".to_string()),
                        Some(FailureClass::RuntimeError),
                    ),
                };
                ResultReport {
                    node_id,
                    result,
                    failure_reason,
                    failure_classification,
                }
            }
            Err(e) => ResultReport {
                node_id,
                result: unstarted_result(job.id, &e.to_string()),
                failure_reason: Some(format!("failed to start encoder: {e}")),
                failure_classification: Some(FailureClass::RuntimeError),
            },
        }
    }

    /// Wait for running jobs to finish naturally, up to `grace`.
    async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.running.read().await.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn touch_master_contact(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_master_contact.store(now, Ordering::Relaxed);
    }
}

/// Result record for a job whose encoder never started: the platform did its
/// part (nothing to supervise), the workload never happened.
fn unstarted_result(job_id: Uuid, why: &str) -> WrapperResult {
    let now = chrono::Utc::now();
    WrapperResult {
        job_id,
        pid: 0,
        mode: WrapperMode::Run,
        start_time: now,
        end_time: now,
        duration_ms: 0,
        exit_code: None,
        platform_sla_met: true,
        platform_sla_reason: format!("workload_not_started: {why}"),
        intent: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstarted_result_meets_platform_sla() {
        let r = unstarted_result(Uuid::new_v4(), "bad codec");
        assert!(r.platform_sla_met);
        assert!(!r.workload_succeeded());
        assert_eq!(r.duration_ms, 0);
    }
}
