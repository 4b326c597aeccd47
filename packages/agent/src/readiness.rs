//! Worker readiness endpoint.
//!
//! OK iff an encoder binary is on PATH, the scratch partition has more than
//! 10% free space, and the master answered within the last minute. A worker
//! that lost the master reports unready here but keeps any in-flight
//! workload running.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sysinfo::Disks;
use tracing::info;

const MIN_FREE_DISK_RATIO: f64 = 0.10;
const MASTER_CONTACT_WINDOW_SECS: u64 = 60;

#[derive(Clone)]
pub struct ReadinessState {
    pub scratch_dir: PathBuf,
    pub last_master_contact: Arc<AtomicU64>,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    encoder_available: bool,
    scratch_disk_ok: bool,
    master_reachable: bool,
}

pub fn router(state: ReadinessState) -> Router {
    Router::new()
        .route("/ready", get(readiness_handler))
        .with_state(state)
}

pub async fn serve(state: ReadinessState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "readiness endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn readiness_handler(
    State(state): State<ReadinessState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let encoder_available =
        which::which("ffmpeg").is_ok() || which::which("gst-launch-1.0").is_ok();
    let scratch_disk_ok = scratch_has_space(&state.scratch_dir);
    let master_reachable = master_recently_reachable(&state.last_master_contact);

    let ready = encoder_available && scratch_disk_ok && master_reachable;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            encoder_available,
            scratch_disk_ok,
            master_reachable,
        }),
    )
}

/// Free space on the disk holding the scratch dir, against the 10% floor.
/// Unknown mounts err on the side of ready.
fn scratch_has_space(scratch_dir: &std::path::Path) -> bool {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|d| scratch_dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match best {
        Some(disk) if disk.total_space() > 0 => {
            let free_ratio = disk.available_space() as f64 / disk.total_space() as f64;
            free_ratio > MIN_FREE_DISK_RATIO
        }
        _ => true,
    }
}

fn master_recently_reachable(last_contact: &AtomicU64) -> bool {
    let last = last_contact.load(Ordering::Relaxed);
    if last == 0 {
        return false;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.saturating_sub(last) <= MASTER_CONTACT_WINDOW_SECS
}
