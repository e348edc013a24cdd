//! HTTP client for the model server. The tags listing doubles as the
//! readiness probe.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::GaleError;

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub total_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<InstalledModel>,
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(host_port: u16) -> Self {
        Self::with_base_url(&format!("http://localhost:{host_port}"))
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build model server HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Non-streaming completion. A body with `done:false` means the
    /// server stopped early and is treated as a failure.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GaleError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });

        let send = self.http.post(&url).json(&body).send();
        let resp = tokio::select! {
            resp = send => resp?,
            _ = cancel.cancelled() => return Err(GaleError::Cancelled),
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GaleError::ModelServer(format!(
                "generate returned HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = tokio::select! {
            body = resp.json() => body?,
            _ = cancel.cancelled() => return Err(GaleError::Cancelled),
        };

        if !parsed.done {
            return Err(GaleError::ModelServer(
                "generate response incomplete (done=false)".into(),
            ));
        }
        Ok(parsed)
    }

    pub async fn tags(&self) -> Result<TagsResponse, GaleError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GaleError::ModelServer(format!(
                "tags returned HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Readiness: the server answers the tags listing.
    pub async fn is_ready(&self) -> bool {
        self.tags().await.is_ok()
    }
}
