use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GaleError;

/// Top-level runner configuration, read from the environment once at
/// startup. Missing required values are configuration errors and fatal.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the coordinator, e.g. `http://coordinator:8080`.
    pub coordinator_url: String,
    /// Wallet address derived from the local keystore.
    pub wallet_address: String,
    /// Stable device identifier, derived externally.
    pub device_id: String,
    /// Local port the webhook server listens on.
    pub local_port: u16,
    /// Overall deadline for graceful shutdown.
    pub shutdown_timeout: Duration,
    pub tunnel: TunnelConfig,
    pub ollama: OllamaConfig,
    pub heartbeat: HeartbeatConfig,
    pub gate: GateConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// Tunnel executable name, resolved on PATH.
    pub binary: String,
    /// Remote tunnel server the local port is exposed through.
    pub server: String,
    pub remote_port: Option<u16>,
    pub secret: Option<String>,
    /// Upper bound on waiting for the public URL to appear on stdout.
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub enabled: bool,
    pub image: String,
    pub container_name: String,
    /// Host port published to the container's 11434.
    pub host_port: u16,
    /// Host directory bind-mounted to /root/.ollama.
    pub data_dir: PathBuf,
    /// Models to have available before registration.
    pub models: Vec<String>,
    /// Remove the container on shutdown, not just stop it.
    pub cleanup_on_shutdown: bool,
    pub readiness_attempts: u32,
    pub readiness_delay: Duration,
    pub pull_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// First backoff step after a failed tick; grows linearly per
    /// consecutive failure up to `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Inner send retries within one tick.
    pub max_retries: u32,
    pub send_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Concurrent in-flight LLM requests. The model server handles one
    /// request well; more degrade all of them.
    pub capacity: usize,
    pub min_interval: Duration,
    /// Slot linger after a request completes, letting the model server
    /// quiesce before the next caller proceeds.
    pub release_delay: Duration,
    pub settle_delay: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-task wall-clock ceiling for shell tasks.
    pub task_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: "bore".to_string(),
            server: "bore.pub".to_string(),
            remote_port: None,
            secret: None,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "ollama/ollama".to_string(),
            container_name: "gale-ollama".to_string(),
            host_port: 11434,
            data_dir: home_dir().join(".ollama"),
            models: Vec::new(),
            cleanup_on_shutdown: false,
            readiness_attempts: 30,
            readiness_delay: Duration::from_secs(2),
            pull_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            max_retries: 3,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            min_interval: Duration::from_secs(3),
            release_delay: Duration::from_secs(1),
            settle_delay: Duration::from_millis(200),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(3600),
            max_output_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, GaleError> {
        let coordinator_url = require("GALE_COORDINATOR_URL")?;
        let wallet_address = require("GALE_WALLET_ADDRESS")?;
        let device_id = require("GALE_DEVICE_ID")?;

        let local_port = parse_var("GALE_LOCAL_PORT", 8090u16)?;

        let tunnel = TunnelConfig {
            enabled: parse_var("GALE_TUNNEL_ENABLED", false)?,
            binary: env_or("GALE_TUNNEL_BINARY", "bore"),
            server: env_or("GALE_TUNNEL_SERVER", "bore.pub"),
            remote_port: parse_opt("GALE_TUNNEL_REMOTE_PORT")?,
            secret: env::var("GALE_TUNNEL_SECRET").ok().filter(|s| !s.is_empty()),
            ..TunnelConfig::default()
        };

        let models: Vec<String> = env::var("GALE_MODELS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let ollama = OllamaConfig {
            enabled: parse_var("GALE_OLLAMA_ENABLED", !models.is_empty())?,
            image: env_or("GALE_OLLAMA_IMAGE", "ollama/ollama"),
            container_name: env_or("GALE_OLLAMA_CONTAINER", "gale-ollama"),
            host_port: parse_var("GALE_OLLAMA_PORT", 11434u16)?,
            data_dir: env::var("GALE_OLLAMA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home_dir().join(".ollama")),
            models,
            cleanup_on_shutdown: parse_var("GALE_OLLAMA_CLEANUP", false)?,
            ..OllamaConfig::default()
        };

        if ollama.enabled && ollama.models.is_empty() {
            tracing::warn!("GALE_MODELS not set — registering without model capabilities");
        }

        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(parse_var("GALE_HEARTBEAT_SECS", 30u64)?),
            ..HeartbeatConfig::default()
        };

        Ok(Self {
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
            wallet_address,
            device_id,
            local_port,
            shutdown_timeout: Duration::from_secs(parse_var("GALE_SHUTDOWN_SECS", 30u64)?),
            tunnel,
            ollama,
            heartbeat,
            gate: GateConfig::default(),
            executor: ExecutorConfig::default(),
        })
    }

    /// The URL the runner is reachable under when no tunnel is in play.
    pub fn local_webhook_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }
}

fn require(name: &str) -> Result<String, GaleError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(GaleError::Config(format!("{name} is not set"))),
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, GaleError> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| GaleError::Config(format!("{name} has invalid value {raw:?}"))),
        _ => Ok(default),
    }
}

fn parse_opt<T: std::str::FromStr>(name: &str) -> Result<Option<T>, GaleError> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| GaleError::Config(format!("{name} has invalid value {raw:?}"))),
        _ => Ok(None),
    }
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
