//! Encoder engines: command construction and availability probing.

use std::path::Path;

use anyhow::{bail, Result};
use tracing::info;

use transcode_core::job::{EngineKind, Job, QueueClass};

/// A concrete encoder the worker can drive.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;
    /// Whether the engine's binary is usable on this host.
    fn probe(&self) -> bool;
    /// The argv the wrapper will supervise for this job.
    fn build_command(&self, job: &Job, scratch_dir: &Path) -> Result<Vec<String>>;
}

fn param_str<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.parameters.get(key).and_then(|v| v.as_str())
}

fn param_f64(job: &Job, key: &str) -> Option<f64> {
    job.parameters.get(key).and_then(|v| v.as_f64())
}

/// Output path under the scratch dir when the job does not name one.
fn default_output(job: &Job, scratch_dir: &Path, extension: &str) -> String {
    scratch_dir
        .join(format!("{}.{extension}", job.id))
        .to_string_lossy()
        .into_owned()
}

// ============================================================================
// FFmpeg
// ============================================================================

pub struct FfmpegEngine;

impl Engine for FfmpegEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ffmpeg
    }

    fn probe(&self) -> bool {
        which::which("ffmpeg").is_ok()
    }

    fn build_command(&self, job: &Job, scratch_dir: &Path) -> Result<Vec<String>> {
        let mut argv = vec!["ffmpeg".to_string(), "-hide_banner".into(), "-y".into()];

        // Without a declared input the job is synthetic: drive the encoder
        // from a generated test source so benchmarks need no media files.
        match param_str(job, "input") {
            Some(input) => {
                argv.push("-i".into());
                argv.push(input.to_string());
            }
            None => {
                let duration = param_f64(job, "duration_seconds").unwrap_or(10.0);
                let resolution = param_str(job, "resolution").unwrap_or("1920x1080");
                argv.push("-f".into());
                argv.push("lavfi".into());
                argv.push("-i".into());
                argv.push(format!(
                    "testsrc2=duration={duration}:size={resolution}:rate=30"
                ));
            }
        }

        if let Some(duration) = param_f64(job, "duration_seconds") {
            argv.push("-t".into());
            argv.push(duration.to_string());
        }

        let codec = match param_str(job, "codec") {
            Some("h264") | None => "libx264",
            Some("h265") | Some("hevc") => "libx265",
            Some("h264_nvenc") => "h264_nvenc",
            Some("hevc_nvenc") => "hevc_nvenc",
            Some(other) => bail!("unsupported codec {other:?}"),
        };
        argv.push("-c:v".into());
        argv.push(codec.to_string());

        if let Some(bitrate) = param_str(job, "bitrate") {
            argv.push("-b:v".into());
            argv.push(bitrate.to_string());
        }
        if param_str(job, "input").is_some() {
            if let Some(resolution) = param_str(job, "resolution") {
                argv.push("-s".into());
                argv.push(resolution.to_string());
            }
        }

        let output = param_str(job, "output")
            .map(str::to_string)
            .unwrap_or_else(|| default_output(job, scratch_dir, "mp4"));
        argv.push(output);

        Ok(argv)
    }
}

// ============================================================================
// GStreamer
// ============================================================================

pub struct GstreamerEngine;

impl Engine for GstreamerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Gstreamer
    }

    fn probe(&self) -> bool {
        which::which("gst-launch-1.0").is_ok()
    }

    fn build_command(&self, job: &Job, scratch_dir: &Path) -> Result<Vec<String>> {
        let mut argv = vec!["gst-launch-1.0".to_string(), "-e".into()];

        match param_str(job, "input") {
            Some(input) => {
                argv.push("filesrc".into());
                argv.push(format!("location={input}"));
                argv.push("!".into());
                argv.push("decodebin".into());
            }
            None => {
                let duration = param_f64(job, "duration_seconds").unwrap_or(10.0);
                argv.push("videotestsrc".into());
                argv.push(format!("num-buffers={}", (duration * 30.0) as u64));
            }
        }
        argv.push("!".into());
        argv.push("videoconvert".into());
        argv.push("!".into());

        match param_str(job, "codec") {
            Some("h265") | Some("hevc") => argv.push("x265enc".into()),
            _ => argv.push("x264enc".into()),
        }
        if let Some(bitrate) = param_str(job, "bitrate") {
            // gstreamer takes kbit/s; accept "4M"/"4000k" style values.
            if let Some(kbps) = parse_bitrate_kbps(bitrate) {
                argv.push(format!("bitrate={kbps}"));
            }
        }

        argv.push("!".into());
        argv.push("mp4mux".into());
        argv.push("!".into());
        argv.push("filesink".into());
        let output = param_str(job, "output")
            .map(str::to_string)
            .unwrap_or_else(|| default_output(job, scratch_dir, "mp4"));
        argv.push(format!("location={output}"));

        Ok(argv)
    }
}

fn parse_bitrate_kbps(raw: &str) -> Option<u64> {
    let raw = raw.trim().to_lowercase();
    if let Some(mbits) = raw.strip_suffix('m') {
        return mbits.parse::<f64>().ok().map(|m| (m * 1000.0) as u64);
    }
    if let Some(kbits) = raw.strip_suffix('k') {
        return kbits.parse::<f64>().ok().map(|k| k as u64);
    }
    raw.parse::<u64>().ok().map(|bits| bits / 1000)
}

// ============================================================================
// Selection
// ============================================================================

/// Pick the engine for a job. An explicit request wins; auto prefers
/// gstreamer for live work and ffmpeg for file/batch work. A missing
/// requested engine falls back to ffmpeg, never to a stub.
pub fn select_engine(job: &Job, available: &[EngineKind]) -> EngineKind {
    let has = |kind: EngineKind| available.contains(&kind);

    match job.engine {
        EngineKind::Ffmpeg | EngineKind::Gstreamer => {
            if has(job.engine) {
                job.engine
            } else {
                info!(
                    job_id = %job.id,
                    requested = ?job.engine,
                    "requested engine unavailable, falling back to ffmpeg"
                );
                EngineKind::Ffmpeg
            }
        }
        EngineKind::Auto => match job.queue {
            QueueClass::Live if has(EngineKind::Gstreamer) => EngineKind::Gstreamer,
            _ if has(EngineKind::Ffmpeg) => EngineKind::Ffmpeg,
            _ if has(EngineKind::Gstreamer) => EngineKind::Gstreamer,
            _ => EngineKind::Ffmpeg,
        },
    }
}
