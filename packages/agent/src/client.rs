//! HTTP client for the master API, with bounded transport retries.
//!
//! Retries cover only these request/response interactions, with exponential
//! backoff for classified transient errors. They never apply to workload
//! execution, and a cancellation signal aborts them immediately.

use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use transcode_core::job::Job;
use transcode_core::protocol::{
    HeartbeatRequest, HeartbeatResponse, RegisterNodeRequest, RegisterNodeResponse, ResultReport,
};

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);
const RETRY_MULTIPLIER: u32 = 2;
const RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("master returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("canceled")]
    Canceled,
}

impl ClientError {
    /// Transient per the transport-retry policy: connection-level failures,
    /// timeouts, and 5xx responses. Client errors (4xx) are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() && e.status().is_none()
            }
            ClientError::Status { status, .. } => status.is_server_error(),
            ClientError::Canceled => false,
        }
    }
}

pub struct MasterClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub async fn register(
        &self,
        req: &RegisterNodeRequest,
        cancel: &CancellationToken,
    ) -> Result<RegisterNodeResponse, ClientError> {
        self.with_retries("register", cancel, || async move {
            let response = self
                .http
                .post(format!("{}/nodes/register", self.base_url))
                .bearer_auth(&self.token)
                .json(req)
                .send()
                .await?;
            decode(response).await
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        node_id: Uuid,
        running_jobs: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatResponse, ClientError> {
        self.with_retries("heartbeat", cancel, || {
            let running_jobs = running_jobs.clone();
            async move {
                let response = self
                    .http
                    .post(format!("{}/nodes/{}/heartbeat", self.base_url, node_id))
                    .bearer_auth(&self.token)
                    .json(&HeartbeatRequest { running_jobs })
                    .send()
                    .await?;
                decode(response).await
            }
        })
        .await
    }

    /// Poll for the next assignment. `None` when the backlog is empty (204).
    pub async fn next_job(
        &self,
        node_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, ClientError> {
        self.with_retries("next_job", cancel, || async move {
            let response = self
                .http
                .get(format!("{}/jobs/next", self.base_url))
                .query(&[("node_id", node_id.to_string())])
                .bearer_auth(&self.token)
                .send()
                .await?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            decode(response).await.map(Some)
        })
        .await
    }

    pub async fn start_job(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.with_retries("start_job", cancel, || async move {
            let response = self
                .http
                .post(format!("{}/jobs/{}/start", self.base_url, job_id))
                .bearer_auth(&self.token)
                .send()
                .await?;
            check(response).await
        })
        .await
    }

    pub async fn job_heartbeat(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.with_retries("job_heartbeat", cancel, || async move {
            let response = self
                .http
                .post(format!("{}/jobs/{}/heartbeat", self.base_url, job_id))
                .bearer_auth(&self.token)
                .send()
                .await?;
            check(response).await
        })
        .await
    }

    /// Deliver the final wrapper result. Safe to repeat: the master treats a
    /// re-reported terminal state as a no-op.
    pub async fn report_result(
        &self,
        report: &ResultReport,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.with_retries("report_result", cancel, || async move {
            let response = self
                .http
                .post(format!("{}/results", self.base_url))
                .bearer_auth(&self.token)
                .json(report)
                .send()
                .await?;
            check(response).await
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        op: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut backoff = RETRY_INITIAL;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Canceled);
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        op = op,
                        attempt = attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient transport error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Canceled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * RETRY_MULTIPLIER).min(RETRY_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }
    Ok(response.json().await?)
}

async fn check(response: reqwest::Response) -> Result<(), ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = ClientError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::CONFLICT,
            StatusCode::NOT_FOUND,
        ] {
            let err = ClientError::Status {
                status,
                body: String::new(),
            };
            assert!(!err.is_transient(), "{status} should be permanent");
        }
    }

    #[test]
    fn cancellation_is_not_retried() {
        assert!(!ClientError::Canceled.is_transient());
    }
}
