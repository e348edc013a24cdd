//! LLM prompt executor: every model-server request goes through the
//! shared rate gate, with bounded retries around the whole
//! acquire/generate cycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::GateConfig;
use crate::error::GaleError;
use crate::executor::TaskExecutor;
use crate::gate::{with_retries, LlmGate};
use crate::model::{Task, TaskResult};
use crate::ollama::client::OllamaClient;

pub struct LlmExecutor {
    gate: Arc<LlmGate>,
    client: Arc<OllamaClient>,
    max_attempts: u32,
    retry_base_delay: std::time::Duration,
}

impl LlmExecutor {
    pub fn new(gate: Arc<LlmGate>, client: Arc<OllamaClient>, cfg: &GateConfig) -> Self {
        Self {
            gate,
            client,
            max_attempts: cfg.max_attempts,
            retry_base_delay: cfg.retry_base_delay,
        }
    }
}

#[async_trait]
impl TaskExecutor for LlmExecutor {
    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GaleError> {
        let prompt = task
            .config
            .prompt
            .as_deref()
            .ok_or_else(|| GaleError::Validation(format!("llm task {} has no prompt", task.id)))?;
        let model = task
            .config
            .model
            .as_deref()
            .ok_or_else(|| GaleError::Validation(format!("llm task {} has no model", task.id)))?;

        let (response, total) = with_retries(
            self.max_attempts,
            self.retry_base_delay,
            &cancel,
            |_attempt| {
                let cancel = cancel.clone();
                async move {
                    let permit = self.gate.acquire(&cancel).await?;
                    let response = self.client.generate(model, prompt, &cancel).await?;
                    self.gate.settle().await;
                    drop(permit);
                    Ok(response)
                }
            },
        )
        .await?;

        let mut result = TaskResult::new(&task.id);
        result.exit_code = 0;
        result.stdout = response.response;
        // Total wall-clock across all attempts, not just the last.
        result.execution_time_ms = total.as_millis() as u64;

        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), json!(model));
        if let Some(n) = response.prompt_eval_count {
            metadata.insert("prompt_eval_count".to_string(), json!(n));
        }
        if let Some(n) = response.eval_count {
            metadata.insert("eval_count".to_string(), json!(n));
        }
        result.metadata = Some(metadata);

        Ok(result)
    }
}
