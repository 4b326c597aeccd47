//! Run or attach to a workload and watch it to its natural end.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use transcode_core::job::WrapperConstraints;
use transcode_core::protocol::{WrapperMode, WrapperResult};

use crate::cgroup::CgroupManager;
use crate::metrics::WrapperMetrics;
use crate::result::{build_result, PlatformOutcome};

/// Liveness poll cadence in attach mode.
const ATTACH_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SuperviseError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn workload: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
}

#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub job_id: Uuid,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub constraints: WrapperConstraints,
}

pub struct Supervisor {
    cgroups: CgroupManager,
    metrics: Arc<WrapperMetrics>,
}

impl Supervisor {
    pub fn new(cgroups: CgroupManager, metrics: Arc<WrapperMetrics>) -> Self {
        Self { cgroups, metrics }
    }

    pub fn metrics(&self) -> &Arc<WrapperMetrics> {
        &self.metrics
    }

    /// Fork the workload into its own process group, apply limits, and wait
    /// for its natural exit. The child is deliberately not tied to this
    /// process's lifetime: a dead wrapper leaves the encoder running.
    pub async fn run(&self, spec: WorkloadSpec) -> Result<WrapperResult, SuperviseError> {
        let program = spec.argv.first().ok_or(SuperviseError::EmptyCommand)?;
        let intent = spec.argv.join(" ");

        let mut cmd = Command::new(program);
        cmd.args(&spec.argv[1..]);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        // No pipes between wrapper and workload: a dying wrapper must not be
        // able to feed the encoder SIGPIPE through a closed descriptor.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // New process group, wrapper not the session leader: SIGKILL to the
        // wrapper (or its group) never reaches the encoder.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let start_time = Utc::now();
        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();
        self.metrics.record_start(WrapperMode::Run);
        info!(job_id = %spec.job_id, pid = pid, intent = %intent, "workload started");

        // Limits go on after the fork; failures degrade, never stop.
        let mut degradations = self.cgroups.setup(spec.job_id, &spec.constraints);
        if degradations.is_empty() && !spec.constraints.is_empty() {
            if let Err(e) = self.cgroups.join(spec.job_id, pid) {
                warn!(job_id = %spec.job_id, error = %e, "cgroup join failed");
                degradations.push(format!("cgroup join failed: {e}"));
            }
        }

        let status = child.wait().await?;
        let end_time = Utc::now();

        self.cgroups.cleanup(spec.job_id);

        let outcome = if degradations.is_empty() {
            PlatformOutcome::ObservedExit
        } else {
            PlatformOutcome::ObservedExitDegraded(degradations)
        };

        let result = build_result(
            spec.job_id,
            pid,
            WrapperMode::Run,
            intent,
            start_time,
            end_time,
            status.code(),
            outcome,
        );
        self.metrics.record_result(&result);
        info!(
            job_id = %spec.job_id,
            exit_code = ?result.exit_code,
            sla_met = result.platform_sla_met,
            "workload finished"
        );
        Ok(result)
    }

    /// Observe an existing PID until it exits. Limits are applied to the
    /// process's own cgroup when possible; the process is never moved,
    /// signaled, or reaped.
    pub async fn attach(
        &self,
        job_id: Uuid,
        pid: u32,
        constraints: WrapperConstraints,
    ) -> Result<WrapperResult, SuperviseError> {
        if !process_alive(pid) {
            return Err(SuperviseError::NoSuchProcess(pid));
        }

        self.metrics.record_start(WrapperMode::Attach);
        let intent = format!("attach pid {pid}");
        let start_time = Utc::now();
        info!(job_id = %job_id, pid = pid, "attached to workload");

        let degradations = match current_cgroup_of(pid) {
            Some(group) => self.cgroups.apply_to_existing(&group, &constraints),
            None if constraints.is_empty() => Vec::new(),
            None => vec!["could not resolve the process's cgroup".to_string()],
        };

        while process_alive(pid) {
            tokio::time::sleep(ATTACH_POLL).await;
        }
        let end_time = Utc::now();

        // The exit code belongs to whoever reaps the process; we only saw it
        // leave.
        let outcome = if degradations.is_empty() {
            PlatformOutcome::ObservedExit
        } else {
            PlatformOutcome::ObservedExitDegraded(degradations)
        };
        let result = build_result(
            job_id, pid, WrapperMode::Attach, intent, start_time, end_time, None, outcome,
        );
        self.metrics.record_result(&result);
        info!(job_id = %job_id, pid = pid, "attached workload exited");
        Ok(result)
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// The v2 cgroup path of a process, from /proc/<pid>/cgroup ("0::/path").
fn current_cgroup_of(pid: u32) -> Option<PathBuf> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/cgroup")).ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix("0::").map(|path| PathBuf::from(path.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupManager;

    fn supervisor() -> Supervisor {
        // Point the cgroup root at an empty directory so tests exercise the
        // degraded path instead of the host's hierarchy.
        let dir = tempfile::tempdir().unwrap();
        Supervisor::new(
            CgroupManager::with_root(dir.path().to_path_buf()),
            Arc::new(WrapperMetrics::new()),
        )
    }

    #[tokio::test]
    async fn run_reports_zero_exit() {
        let sup = supervisor();
        let result = sup
            .run(WorkloadSpec {
                job_id: Uuid::new_v4(),
                argv: vec!["true".into()],
                cwd: None,
                constraints: WrapperConstraints::default(),
            })
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(result.platform_sla_met);
        assert_eq!(result.mode, WrapperMode::Run);
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_with_sla_met() {
        let sup = supervisor();
        let result = sup
            .run(WorkloadSpec {
                job_id: Uuid::new_v4(),
                argv: vec!["false".into()],
                cwd: None,
                constraints: WrapperConstraints::default(),
            })
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(1));
        assert!(result.platform_sla_met);
        assert_eq!(result.platform_sla_reason, "workload_failed_platform_ok");
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let sup = supervisor();
        let err = sup
            .run(WorkloadSpec {
                job_id: Uuid::new_v4(),
                argv: vec![],
                cwd: None,
                constraints: WrapperConstraints::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::EmptyCommand));
    }

    #[tokio::test]
    async fn attach_rejects_dead_pid() {
        let sup = supervisor();
        // PID beyond the default pid_max.
        let err = sup
            .attach(Uuid::new_v4(), 4_194_400, WrapperConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::NoSuchProcess(_)));
    }

    #[tokio::test]
    async fn constrained_run_records_degraded_governance() {
        let sup = supervisor();
        let result = sup
            .run(WorkloadSpec {
                job_id: Uuid::new_v4(),
                argv: vec!["true".into()],
                cwd: None,
                constraints: WrapperConstraints {
                    cpu_weight: Some(100),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        // No cgroup tree under the test root: governance degrades, the
        // workload still runs and the SLA holds.
        assert!(result.platform_sla_met);
        assert!(result.platform_sla_reason.contains("governance_degraded"));
    }
}
