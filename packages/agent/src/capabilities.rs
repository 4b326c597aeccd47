//! Local capability probing: CPU, GPU, and encoder availability.

use std::collections::BTreeMap;
use std::process::Command;

use sysinfo::System;
use tracing::{debug, info};

use transcode_core::node::{NodeCapabilities, NodeType};

/// Everything registration needs about this host.
#[derive(Debug, Clone)]
pub struct HostProfile {
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    pub ram_bytes: i64,
    pub labels: BTreeMap<String, String>,
}

/// Probe the host. Subprocess probes (ffmpeg/gstreamer/nvidia-smi) are best
/// effort; an absent binary simply means the capability is not advertised.
pub fn probe() -> HostProfile {
    let cpu_threads = num_cpus::get() as u32;
    let cpu_model = read_cpu_model().unwrap_or_else(|| "unknown".to_string());

    let mut sys = System::new();
    sys.refresh_memory();
    let ram_bytes = sys.total_memory() as i64;

    let ffmpeg_encoders = probe_ffmpeg_encoders();
    let mut encoders = Vec::new();
    if ffmpeg_encoders.iter().any(|e| e == "libx264") {
        encoders.push("x264".to_string());
    }
    if ffmpeg_encoders.iter().any(|e| e == "libx265") {
        encoders.push("x265".to_string());
    }
    if which::which("gst-launch-1.0").is_ok() {
        encoders.push("gstreamer".to_string());
    }

    let gpu_type = probe_gpu_name();
    let has_gpu = gpu_type.is_some();
    let mut gpu_capabilities = Vec::new();
    if has_gpu {
        if ffmpeg_encoders.iter().any(|e| e == "h264_nvenc") {
            gpu_capabilities.push("nvenc_h264".to_string());
        }
        if ffmpeg_encoders.iter().any(|e| e == "hevc_nvenc") {
            gpu_capabilities.push("nvenc_h265".to_string());
        }
    }

    let mut labels = BTreeMap::new();
    if let Ok(name) = hostname::get() {
        labels.insert("hostname".to_string(), name.to_string_lossy().into_owned());
    }
    labels.insert("os".to_string(), std::env::consts::OS.to_string());

    let profile = HostProfile {
        node_type: if has_gpu { NodeType::Gpu } else { NodeType::Cpu },
        capabilities: NodeCapabilities {
            cpu_threads,
            cpu_model,
            has_gpu,
            gpu_type,
            gpu_capabilities,
            encoders,
        },
        ram_bytes,
        labels,
    };

    info!(
        cpu_threads = profile.capabilities.cpu_threads,
        has_gpu = profile.capabilities.has_gpu,
        encoders = ?profile.capabilities.encoders,
        gpu_capabilities = ?profile.capabilities.gpu_capabilities,
        "host capabilities probed"
    );
    profile
}

fn read_cpu_model() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo.lines().find_map(|line| {
        line.strip_prefix("model name")
            .and_then(|rest| rest.split_once(':'))
            .map(|(_, model)| model.trim().to_string())
    })
}

/// Encoder names reported by `ffmpeg -encoders`, empty when ffmpeg is absent.
fn probe_ffmpeg_encoders() -> Vec<String> {
    let Ok(ffmpeg) = which::which("ffmpeg") else {
        debug!("ffmpeg not found on PATH");
        return Vec::new();
    };

    let output = match Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };

    // Lines look like " V....D libx264    H.264 / AVC ...": flags, name, rest.
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if !flags.starts_with('V') {
                return None;
            }
            parts.next().map(str::to_string)
        })
        .collect()
}

fn probe_gpu_name() -> Option<String> {
    let nvidia_smi = which::which("nvidia-smi").ok()?;
    let output = Command::new(nvidia_smi)
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_at_least_one_cpu_thread() {
        let profile = probe();
        assert!(profile.capabilities.cpu_threads >= 1);
    }

    #[test]
    fn gpu_capabilities_require_a_gpu() {
        let profile = probe();
        if !profile.capabilities.has_gpu {
            assert!(profile.capabilities.gpu_capabilities.is_empty());
            assert_eq!(profile.node_type, NodeType::Cpu);
        }
    }

    #[test]
    fn labels_carry_the_os() {
        let profile = probe();
        assert_eq!(
            profile.labels.get("os").map(String::as_str),
            Some(std::env::consts::OS)
        );
    }
}
