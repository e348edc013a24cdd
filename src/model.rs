use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GaleError;

/// Task kind tag. Selects the executor implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Shell,
    Docker,
    LlmPrompt,
    Training,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Kind-specific configuration payload. One struct with optional fields
/// rather than an enum — the wire format is a flat JSON object and tasks
/// arrive from the coordinator with only the fields their kind uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Shell: argv vector, first element is the executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Docker: image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// LLM: prompt text and model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Training: dataset reference, data format, and hyperparameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionSpec>,
    #[serde(default)]
    pub epochs: u32,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub learning_rate: f64,
}

/// Which slice of a shared dataset this runner trains on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// A unit of work delivered over the webhook. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub creator_id: String,
    #[serde(default)]
    pub creator_address: String,
    #[serde(default)]
    pub reward: f64,
    #[serde(default)]
    pub config: TaskConfig,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// Checks the structural invariants a task must satisfy before
    /// execution. Violations are per-task fatal: no retry.
    pub fn validate(&self) -> Result<(), GaleError> {
        if self.id.is_empty() {
            return Err(GaleError::Validation("task id is empty".into()));
        }
        if self.creator_id.is_empty() {
            return Err(GaleError::Validation("task creator id is empty".into()));
        }
        match self.kind {
            TaskKind::Shell => {
                if self.config.command.is_empty() {
                    return Err(GaleError::Validation(format!(
                        "shell task {} has no command",
                        self.id
                    )));
                }
            }
            TaskKind::Docker => {
                if self.config.image.as_deref().unwrap_or("").is_empty() {
                    return Err(GaleError::Validation(format!(
                        "docker task {} has no image",
                        self.id
                    )));
                }
            }
            TaskKind::LlmPrompt => {
                if self.config.prompt.as_deref().unwrap_or("").is_empty() {
                    return Err(GaleError::Validation(format!(
                        "llm task {} has no prompt",
                        self.id
                    )));
                }
                if self.config.model.as_deref().unwrap_or("").is_empty() {
                    return Err(GaleError::Validation(format!(
                        "llm task {} has no model",
                        self.id
                    )));
                }
            }
            TaskKind::Training => {
                if self.config.dataset.as_deref().unwrap_or("").is_empty() {
                    return Err(GaleError::Validation(format!(
                        "training task {} has no dataset",
                        self.id
                    )));
                }
                if self.config.epochs == 0 {
                    return Err(GaleError::Validation(format!(
                        "training task {} has zero epochs",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Emitted exactly once per executed task and posted to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub id: String,
    pub task_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_id_hash: String,
    #[serde(default)]
    pub runner_address: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub creator_address: String,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl TaskResult {
    /// Fresh result for a task. Identity fields are filled in by the
    /// dispatcher before the result leaves the process.
    pub fn new(task_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            created_at: unix_seconds(),
            ..Self::default()
        }
    }

    /// Stamps runner identity onto the result: device id, its SHA-256
    /// hash, the runner address, and the task's creator/reward echo.
    pub fn enrich(&mut self, identity: &RunnerIdentity, task: &Task) {
        self.device_id = identity.device_id.clone();
        self.device_id_hash = device_id_hash(&identity.device_id);
        self.runner_address = identity.device_id.clone();
        self.creator_id = task.creator_id.clone();
        self.creator_address = task.creator_address.clone();
        self.reward = task.reward;
        if self.created_at == 0 {
            self.created_at = unix_seconds();
        }
    }

    pub fn validate(&self) -> Result<(), GaleError> {
        if self.creator_id.is_empty() {
            return Err(GaleError::Validation("result creator id is empty".into()));
        }
        if self.created_at == 0 {
            return Err(GaleError::Validation("result created_at is zero".into()));
        }
        if self.runner_address != self.device_id {
            return Err(GaleError::Validation(
                "result runner address does not match device id".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Busy,
    Offline,
}

/// Periodic status report. Sent as a bare JSON payload, never wrapped
/// in a type-tagged envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub wallet_address: String,
    pub status: RunnerStatus,
    pub timestamp: u64,
    pub uptime: u64,
    pub memory_usage: u64,
    pub cpu_usage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// Who this runner is. The device id is stable across restarts and comes
/// from outside the core; the instance id is minted per process.
#[derive(Debug, Clone)]
pub struct RunnerIdentity {
    pub device_id: String,
    pub instance_id: String,
    pub wallet_address: String,
}

impl RunnerIdentity {
    pub fn new(device_id: String, wallet_address: String) -> Self {
        let instance_id = format!(
            "{}_{}_{}",
            device_id,
            std::process::id(),
            unix_millis()
        );
        Self {
            device_id,
            instance_id,
            wallet_address,
        }
    }
}

/// A model this runner can serve, advertised at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCapability {
    pub model_name: String,
    pub is_loaded: bool,
    pub max_tokens: u64,
}

pub fn device_id_hash(device_id: &str) -> String {
    hex::encode(Sha256::digest(device_id.as_bytes()))
}

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
