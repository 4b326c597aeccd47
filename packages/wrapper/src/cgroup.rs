//! Cgroup limit handling, v1 and v2.
//!
//! Only the four limit files from the job's constraints are ever written:
//! `cpu.max`, `cpu.weight`, `memory.max`, `io.max` (mapped onto the v1
//! equivalents where they exist). Kernel parameters and sysctl are never
//! touched. Every operation is best effort; failures degrade governance and
//! are reported, they never stop the workload.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use transcode_core::job::WrapperConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    /// No usable cgroup filesystem; limits are skipped entirely.
    Unavailable,
}

pub struct CgroupManager {
    root: PathBuf,
    version: CgroupVersion,
}

const GROUP_PREFIX: &str = "transcode-";

impl CgroupManager {
    /// Detect the mounted cgroup layout under /sys/fs/cgroup.
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/sys/fs/cgroup"))
    }

    /// Detection against an arbitrary root, for tests and containers with
    /// remounted hierarchies.
    pub fn with_root(root: PathBuf) -> Self {
        let version = detect_version(&root);
        debug!(root = %root.display(), version = ?version, "cgroup layout detected");
        Self { root, version }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Directory for a job's group in the v2 (or v1 cpu-controller) tree.
    pub fn group_path(&self, job_id: Uuid) -> PathBuf {
        match self.version {
            CgroupVersion::V2 | CgroupVersion::Unavailable => {
                self.root.join(format!("{GROUP_PREFIX}{job_id}"))
            }
            CgroupVersion::V1 => self.root.join("cpu").join(format!("{GROUP_PREFIX}{job_id}")),
        }
    }

    /// Create the per-job group and write the constraint files. Returns the
    /// list of degradations (empty means fully governed).
    pub fn setup(&self, job_id: Uuid, constraints: &WrapperConstraints) -> Vec<String> {
        if self.version == CgroupVersion::Unavailable {
            return vec!["cgroup filesystem unavailable".to_string()];
        }
        if constraints.is_empty() {
            return Vec::new();
        }

        let mut degraded = Vec::new();
        let group = self.group_path(job_id);
        if let Err(e) = fs::create_dir_all(&group) {
            warn!(group = %group.display(), error = %e, "cgroup create failed");
            return vec![format!("cgroup create failed: {e}")];
        }

        match self.version {
            CgroupVersion::V2 => {
                if let Some(cpu_max) = &constraints.cpu_max {
                    write_limit(&group, "cpu.max", cpu_max, &mut degraded);
                }
                if let Some(weight) = constraints.cpu_weight {
                    write_limit(&group, "cpu.weight", &weight.to_string(), &mut degraded);
                }
                if let Some(mem) = constraints.memory_max {
                    write_limit(&group, "memory.max", &mem.to_string(), &mut degraded);
                }
                if let Some(io_max) = &constraints.io_max {
                    write_limit(&group, "io.max", io_max, &mut degraded);
                }
            }
            CgroupVersion::V1 => {
                // v1 equivalents; io.max has no single-file counterpart.
                if let Some(cpu_max) = &constraints.cpu_max {
                    if let Some((quota, period)) = cpu_max.split_once(' ') {
                        write_limit(&group, "cpu.cfs_quota_us", quota, &mut degraded);
                        write_limit(&group, "cpu.cfs_period_us", period, &mut degraded);
                    } else {
                        degraded.push(format!("cpu.max value {cpu_max:?} not splittable for v1"));
                    }
                }
                if let Some(weight) = constraints.cpu_weight {
                    // cpu.weight 1..=10000 maps linearly onto cpu.shares 2..=262144.
                    let shares = (weight as u64).saturating_mul(26) + 2;
                    write_limit(&group, "cpu.shares", &shares.to_string(), &mut degraded);
                }
                if let Some(mem) = constraints.memory_max {
                    let mem_group = self
                        .root
                        .join("memory")
                        .join(format!("{GROUP_PREFIX}{job_id}"));
                    if fs::create_dir_all(&mem_group).is_ok() {
                        write_limit(
                            &mem_group,
                            "memory.limit_in_bytes",
                            &mem.to_string(),
                            &mut degraded,
                        );
                    } else {
                        degraded.push("memory hierarchy unavailable".to_string());
                    }
                }
                if constraints.io_max.is_some() {
                    degraded.push("io.max unsupported on cgroup v1".to_string());
                }
            }
            CgroupVersion::Unavailable => unreachable!(),
        }

        degraded
    }

    /// Move a PID into the job's group. Best effort.
    pub fn join(&self, job_id: Uuid, pid: u32) -> Result<(), std::io::Error> {
        if self.version == CgroupVersion::Unavailable {
            return Ok(());
        }
        let procs = self.group_path(job_id).join("cgroup.procs");
        let mut file = fs::OpenOptions::new().write(true).open(procs)?;
        writeln!(file, "{pid}")
    }

    /// Apply limits to a group the workload already lives in (attach mode).
    /// The group is never created or joined here; v1 layouts are left alone
    /// because the relative path maps to several hierarchies.
    pub fn apply_to_existing(
        &self,
        relative_group: &Path,
        constraints: &WrapperConstraints,
    ) -> Vec<String> {
        if constraints.is_empty() {
            return Vec::new();
        }
        if self.version != CgroupVersion::V2 {
            return vec!["existing-group limits require cgroup v2".to_string()];
        }

        let group = self
            .root
            .join(relative_group.strip_prefix("/").unwrap_or(relative_group));
        if !group.is_dir() {
            return vec![format!("cgroup {} not found", group.display())];
        }

        let mut degraded = Vec::new();
        if let Some(cpu_max) = &constraints.cpu_max {
            write_limit(&group, "cpu.max", cpu_max, &mut degraded);
        }
        if let Some(weight) = constraints.cpu_weight {
            write_limit(&group, "cpu.weight", &weight.to_string(), &mut degraded);
        }
        if let Some(mem) = constraints.memory_max {
            write_limit(&group, "memory.max", &mem.to_string(), &mut degraded);
        }
        if let Some(io_max) = &constraints.io_max {
            write_limit(&group, "io.max", io_max, &mut degraded);
        }
        degraded
    }

    /// Remove the job's group. Skipped when the workload still holds it
    /// (rmdir on a populated group fails with EBUSY, which is fine).
    pub fn cleanup(&self, job_id: Uuid) {
        if self.version == CgroupVersion::Unavailable {
            return;
        }
        let group = self.group_path(job_id);
        if let Err(e) = fs::remove_dir(&group) {
            debug!(group = %group.display(), error = %e, "cgroup removal skipped");
        }
        if self.version == CgroupVersion::V1 {
            let mem_group = self
                .root
                .join("memory")
                .join(format!("{GROUP_PREFIX}{job_id}"));
            let _ = fs::remove_dir(mem_group);
        }
    }
}

impl Default for CgroupManager {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_version(root: &Path) -> CgroupVersion {
    if root.join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else if root.join("cpu").is_dir() {
        CgroupVersion::V1
    } else {
        CgroupVersion::Unavailable
    }
}

fn write_limit(group: &Path, file: &str, value: &str, degraded: &mut Vec<String>) {
    let path = group.join(file);
    if let Err(e) = fs::write(&path, value) {
        warn!(path = %path.display(), error = %e, "cgroup limit write failed");
        degraded.push(format!("{file} write failed: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v2_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu io memory").unwrap();
        dir
    }

    #[test]
    fn detects_v2_by_controllers_file() {
        let root = v2_root();
        let mgr = CgroupManager::with_root(root.path().to_path_buf());
        assert_eq!(mgr.version(), CgroupVersion::V2);
    }

    #[test]
    fn detects_v1_by_cpu_hierarchy() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("cpu")).unwrap();
        let mgr = CgroupManager::with_root(dir.path().to_path_buf());
        assert_eq!(mgr.version(), CgroupVersion::V1);
    }

    #[test]
    fn missing_layout_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mgr = CgroupManager::with_root(dir.path().to_path_buf());
        assert_eq!(mgr.version(), CgroupVersion::Unavailable);
    }

    #[test]
    fn v2_setup_writes_the_four_limit_files() {
        let root = v2_root();
        let mgr = CgroupManager::with_root(root.path().to_path_buf());
        let job_id = Uuid::new_v4();

        let degraded = mgr.setup(
            job_id,
            &WrapperConstraints {
                cpu_max: Some("200000 100000".into()),
                cpu_weight: Some(100),
                memory_max: Some(1 << 30),
                io_max: Some("8:0 rbps=1048576".into()),
            },
        );
        assert!(degraded.is_empty(), "degraded: {degraded:?}");

        let group = mgr.group_path(job_id);
        assert_eq!(fs::read_to_string(group.join("cpu.max")).unwrap(), "200000 100000");
        assert_eq!(fs::read_to_string(group.join("cpu.weight")).unwrap(), "100");
        assert_eq!(
            fs::read_to_string(group.join("memory.max")).unwrap(),
            (1u64 << 30).to_string()
        );
        assert_eq!(
            fs::read_to_string(group.join("io.max")).unwrap(),
            "8:0 rbps=1048576"
        );
    }

    #[test]
    fn empty_constraints_write_nothing() {
        let root = v2_root();
        let mgr = CgroupManager::with_root(root.path().to_path_buf());
        let job_id = Uuid::new_v4();

        let degraded = mgr.setup(job_id, &WrapperConstraints::default());
        assert!(degraded.is_empty());
        assert!(!mgr.group_path(job_id).exists());
    }

    #[test]
    fn unavailable_layout_reports_degradation() {
        let dir = TempDir::new().unwrap();
        let mgr = CgroupManager::with_root(dir.path().to_path_buf());
        let degraded = mgr.setup(
            Uuid::new_v4(),
            &WrapperConstraints {
                cpu_weight: Some(50),
                ..Default::default()
            },
        );
        assert_eq!(degraded.len(), 1);
        assert!(degraded[0].contains("unavailable"));
    }

    #[test]
    fn cleanup_removes_empty_group() {
        let root = v2_root();
        let mgr = CgroupManager::with_root(root.path().to_path_buf());
        let job_id = Uuid::new_v4();
        mgr.setup(
            job_id,
            &WrapperConstraints {
                cpu_weight: Some(100),
                ..Default::default()
            },
        );
        assert!(mgr.group_path(job_id).exists());

        mgr.cleanup(job_id);
        assert!(!mgr.group_path(job_id).exists());
    }

    #[test]
    fn cleanup_skips_populated_group() {
        let root = v2_root();
        let mgr = CgroupManager::with_root(root.path().to_path_buf());
        let job_id = Uuid::new_v4();
        mgr.setup(
            job_id,
            &WrapperConstraints {
                cpu_weight: Some(100),
                ..Default::default()
            },
        );
        // A subdirectory stands in for a still-running member.
        fs::create_dir(mgr.group_path(job_id).join("member")).unwrap();

        mgr.cleanup(job_id);
        assert!(mgr.group_path(job_id).exists());
    }
}
