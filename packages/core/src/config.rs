//! Configuration loaded from environment variables.
//!
//! Every recognized key has a default matching the documented cadence; only
//! the store URL (and, for the agent, the master URL) are required.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::fsm::{RetryPolicy, TimeoutPolicy};

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be a number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} invalid: {e}")),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Assignment loop cadence.
    pub assignment_interval: Duration,
    /// Health-check loop cadence.
    pub health_interval: Duration,
    /// Cleanup loop cadence.
    pub cleanup_interval: Duration,
    /// Liveness threshold; a node whose last heartbeat is older goes offline.
    pub worker_timeout: Duration,
    /// Max (job, worker) pairs matched per assignment cycle.
    pub assignment_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assignment_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(90),
            assignment_batch_size: 32,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            assignment_interval: env_duration_secs("SCHEDULER_ASSIGNMENT_INTERVAL_SECS", 2)?,
            health_interval: env_duration_secs("SCHEDULER_HEALTH_INTERVAL_SECS", 5)?,
            cleanup_interval: env_duration_secs("SCHEDULER_CLEANUP_INTERVAL_SECS", 10)?,
            worker_timeout: env_duration_secs("WORKER_TIMEOUT_SECS", 90)?,
            assignment_batch_size: env_parse(
                "SCHEDULER_ASSIGNMENT_BATCH_SIZE",
                defaults.assignment_batch_size,
            )?,
        })
    }
}

// ============================================================================
// Store pool
// ============================================================================

/// Connection pool sizing. For N workers polling every P seconds with query
/// time Q, max_open must satisfy `max_open >= N * Q / P` (plus headroom).
#[derive(Debug, Clone)]
pub struct StorePoolConfig {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Duration,
    pub max_idle_time: Duration,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            max_open: 20,
            max_idle: 5,
            max_lifetime: Duration::from_secs(30 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
        }
    }
}

impl StorePoolConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_open: env_parse("STORE_POOL_MAX_OPEN", defaults.max_open)?,
            max_idle: env_parse("STORE_POOL_MAX_IDLE", defaults.max_idle)?,
            max_lifetime: env_duration_secs("STORE_POOL_MAX_LIFETIME_SECS", 30 * 60)?,
            max_idle_time: env_duration_secs("STORE_POOL_MAX_IDLE_TIME_SECS", 5 * 60)?,
        })
    }
}

// ============================================================================
// Master
// ============================================================================

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub database_url: String,
    pub port: u16,
    /// Bearer token -> tenant name. Parsed from `AUTH_TOKENS`
    /// ("token1=tenant1,token2=tenant2").
    pub auth_tokens: HashMap<String, String>,
    /// Token granting access to the tenant admin surface.
    pub admin_token: Option<String>,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    pub pool: StorePoolConfig,
}

impl MasterConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let auth_tokens = env::var("AUTH_TOKENS")
            .map(|raw| parse_token_map(&raw))
            .unwrap_or_default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env_parse("PORT", 8080)?,
            auth_tokens,
            admin_token: env::var("ADMIN_TOKEN").ok(),
            scheduler: SchedulerConfig::from_env()?,
            retry: retry_policy_from_env()?,
            timeouts: timeout_policy_from_env()?,
            pool: StorePoolConfig::from_env()?,
        })
    }
}

fn parse_token_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, tenant) = pair.split_once('=')?;
            let token = token.trim();
            let tenant = tenant.trim();
            if token.is_empty() || tenant.is_empty() {
                None
            } else {
                Some((token.to_string(), tenant.to_string()))
            }
        })
        .collect()
}

fn retry_policy_from_env() -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    Ok(RetryPolicy {
        max_retries: env_parse("RETRY_MAX", defaults.max_retries)?,
        initial_backoff: env_duration_secs("RETRY_INITIAL_BACKOFF_SECS", 5)?,
        max_backoff: env_duration_secs("RETRY_MAX_BACKOFF_SECS", 5 * 60)?,
        multiplier: env_parse("RETRY_MULTIPLIER", defaults.multiplier)?,
    })
}

fn timeout_policy_from_env() -> Result<TimeoutPolicy> {
    let defaults = TimeoutPolicy::default();
    Ok(TimeoutPolicy {
        default_timeout: env_duration_secs("JOB_DEFAULT_TIMEOUT_SECS", 30 * 60)?,
        assigned_timeout: env_duration_secs("JOB_ASSIGNED_TIMEOUT_SECS", 5 * 60)?,
        ffmpeg_safety_margin: defaults.ffmpeg_safety_margin,
        gstreamer_safety_margin: defaults.gstreamer_safety_margin,
    })
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_url: String,
    pub auth_token: String,
    /// Address advertised at registration (readiness endpoint).
    pub advertise_address: String,
    /// Local port for the readiness endpoint.
    pub readiness_port: u16,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_jobs: usize,
    /// Scratch partition for encoder work files.
    pub scratch_dir: std::path::PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let readiness_port: u16 = env_parse("READINESS_PORT", 9100)?;
        let advertise_address = env::var("ADVERTISE_ADDRESS").unwrap_or_else(|_| {
            let host = hostname_or_localhost();
            format!("{host}:{readiness_port}")
        });

        Ok(Self {
            master_url: env::var("MASTER_URL").context("MASTER_URL must be set")?,
            auth_token: env::var("AUTH_TOKEN").context("AUTH_TOKEN must be set")?,
            advertise_address,
            readiness_port,
            heartbeat_interval: env_duration_secs("WORKER_HEARTBEAT_INTERVAL_SECS", 30)?,
            poll_interval: env_duration_secs("WORKER_POLL_INTERVAL_SECS", 5)?,
            shutdown_grace: env_duration_secs("WORKER_SHUTDOWN_GRACE_SECS", 30)?,
            max_concurrent_jobs: env_parse("WORKER_MAX_CONCURRENT_JOBS", 1)?,
            scratch_dir: env::var("SCRATCH_DIR")
                .unwrap_or_else(|_| "/tmp/transcode".to_string())
                .into(),
        })
    }
}

fn hostname_or_localhost() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults_match_documented_cadence() {
        let config = SchedulerConfig::default();
        assert_eq!(config.assignment_interval, Duration::from_secs(2));
        assert_eq!(config.health_interval, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(10));
        assert_eq!(config.worker_timeout, Duration::from_secs(90));
    }

    #[test]
    fn token_map_parses_pairs() {
        let map = parse_token_map("abc=default, xyz=acme");
        assert_eq!(map.get("abc").map(String::as_str), Some("default"));
        assert_eq!(map.get("xyz").map(String::as_str), Some("acme"));
    }

    #[test]
    fn token_map_skips_malformed_pairs() {
        let map = parse_token_map("abc=default,broken,=nameless");
        assert_eq!(map.len(), 1);
    }
}
