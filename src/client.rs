//! HTTP client for the coordinator: task claim/result/complete calls,
//! runner registration, and heartbeat delivery.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::GaleError;
use crate::model::{HeartbeatReport, ModelCapability, Task, TaskResult};

/// Per-call timeout for `start` — claiming must fail fast so the
/// coordinator can hand the task to another runner.
const START_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TaskClient {
    http: reqwest::Client,
    base_url: String,
    /// Sent as `X-Runner-ID` when claiming tasks.
    runner_id: String,
    /// Sent as `X-Device-ID` when saving results.
    device_id: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub wallet_address: String,
    pub status: String,
    pub webhook: String,
    pub model_capabilities: Vec<ModelCapability>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub webhook_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl TaskClient {
    pub fn new(base_url: &str, runner_id: &str, device_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build coordinator HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            runner_id: runner_id.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -----------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------

    pub async fn get_available(&self) -> Result<Vec<Task>, GaleError> {
        let url = format!("{}/api/runners/tasks/available", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GaleError::Coordinator(error_text(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// Claim a task. The coordinator arbitrates between runners; losing
    /// the race is `TaskUnavailable`, not a failure.
    pub async fn start(&self, task_id: &str) -> Result<(), GaleError> {
        let url = format!("{}/api/runners/tasks/{task_id}/start", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("X-Runner-ID", &self.runner_id)
            .timeout(START_TIMEOUT)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(GaleError::TaskUnavailable(task_id.to_string())),
            StatusCode::NOT_FOUND => Err(GaleError::NotFound(format!("task {task_id}"))),
            StatusCode::BAD_REQUEST => Err(GaleError::BadRequest(error_text(resp).await)),
            _ => Err(GaleError::Coordinator(error_text(resp).await)),
        }
    }

    pub async fn complete(&self, task_id: &str) -> Result<(), GaleError> {
        let url = format!("{}/api/runners/tasks/{task_id}/complete", self.base_url);
        let resp = self.http.post(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GaleError::Coordinator(error_text(resp).await));
        }
        Ok(())
    }

    pub async fn save_result(&self, task_id: &str, result: &TaskResult) -> Result<(), GaleError> {
        let url = format!("{}/api/runners/tasks/{task_id}/result", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("X-Device-ID", &self.device_id)
            .json(result)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GaleError::Coordinator(error_text(resp).await));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Runner registration
    // -----------------------------------------------------------------

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, GaleError> {
        let url = format!("{}/api/runners", self.base_url);
        let resp = self.http.post(&url).json(req).send().await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(resp.json().await?),
            _ => Err(GaleError::Coordinator(error_text(resp).await)),
        }
    }

    pub async fn unregister(&self, device_id: &str) -> Result<(), GaleError> {
        let url = format!("{}/api/runners/webhooks/{device_id}", self.base_url);
        let resp = self.http.delete(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GaleError::Coordinator(error_text(resp).await));
        }
        Ok(())
    }

    /// Heartbeats carry their own bare payload; the caller owns retry
    /// and backoff policy.
    pub async fn heartbeat(
        &self,
        report: &HeartbeatReport,
        timeout: Duration,
    ) -> Result<(), GaleError> {
        let url = format!("{}/api/v1/runners/heartbeat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(report)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GaleError::Coordinator(error_text(resp).await));
        }
        Ok(())
    }
}

/// Unwrap a coordinator error body of the form `{"error": "..."}` into
/// its message; fall back to the HTTP status line.
async fn error_text(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) if !body.error.is_empty() => body.error,
        _ => format!("HTTP {status}"),
    }
}
