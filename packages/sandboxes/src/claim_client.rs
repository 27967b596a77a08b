// ABOUTME: Runner-side client for the control plane's job endpoints
// ABOUTME: Poll, claim, heartbeat, and completion calls with structured error codes preserved

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use stratus_core::{ExecutionContext, JobOutcome};
use tracing::debug;

use crate::error::{Result, SandboxError};

/// Where the runner gets its work from
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Run IDs currently claimable in `group`
    async fn poll(&self, group: &str) -> Result<Vec<String>>;

    async fn claim(&self, run_id: &str) -> Result<ExecutionContext>;

    async fn heartbeat(&self, run_id: &str) -> Result<()>;

    /// Report the terminal outcome; called exactly once per claimed run
    async fn complete(&self, run_id: &str, outcome: &JobOutcome) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    run_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// `JobSource` over the control plane's HTTP API
#[derive(Clone)]
pub struct HttpJobSource {
    http_client: Client,
    base_url: String,
    token: String,
}

impl HttpJobSource {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn job_url(&self, run_id: &str, action: &str) -> String {
        format!("{}/api/runners/jobs/{}/{}", self.base_url, run_id, action)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Turn a non-success response into `ClaimRejected` when it carries our error body
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => Err(SandboxError::ClaimRejected {
                code: parsed.error.code,
                message: parsed.error.message,
            }),
            Err(_) => Err(SandboxError::ControlPlane(format!(
                "HTTP {}: {}",
                status,
                body.trim()
            ))),
        }
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn poll(&self, group: &str) -> Result<Vec<String>> {
        let response = self
            .http_client
            .get(format!("{}/api/runners/jobs", self.base_url))
            .query(&[("group", group)])
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        let parsed: PollResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::ControlPlane(format!("Invalid poll response: {}", e)))?;
        Ok(parsed.run_ids)
    }

    async fn claim(&self, run_id: &str) -> Result<ExecutionContext> {
        debug!("Claiming {}", run_id);
        let response = self
            .http_client
            .post(self.job_url(run_id, "claim"))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::ControlPlane(format!("Invalid claim response: {}", e)))
    }

    async fn heartbeat(&self, run_id: &str) -> Result<()> {
        let response = self
            .http_client
            .post(self.job_url(run_id, "heartbeat"))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn complete(&self, run_id: &str, outcome: &JobOutcome) -> Result<()> {
        let response = self
            .http_client
            .post(self.job_url(run_id, "complete"))
            .header("Authorization", self.auth_header())
            .json(outcome)
            .send()
            .await
            .map_err(|e| SandboxError::ControlPlane(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
