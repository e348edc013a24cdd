//! Model-server supervisor: owns the lifecycle of the container that
//! hosts the LLM — install check, idempotent start with readiness
//! probing, model pulls with progress parsing, and teardown.

pub mod client;

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::OllamaConfig;
use crate::error::GaleError;
use crate::model::ModelCapability;
use crate::ollama::client::OllamaClient;

/// Default context window advertised per capability.
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Spinner glyphs the pull progress stream animates with.
const SPINNER_GLYPHS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

pub struct OllamaSupervisor {
    cfg: OllamaConfig,
    client: Arc<OllamaClient>,
    /// Serialises pulls: `ensure_models` must never run concurrently
    /// with itself for the same model.
    pull_lock: tokio::sync::Mutex<()>,
}

impl OllamaSupervisor {
    pub fn new(cfg: OllamaConfig) -> Self {
        let client = Arc::new(OllamaClient::new(cfg.host_port));
        Self {
            cfg,
            client,
            pull_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn client(&self) -> Arc<OllamaClient> {
        Arc::clone(&self.client)
    }

    // -----------------------------------------------------------------
    // Install / start
    // -----------------------------------------------------------------

    /// Verify the container runtime exists and the server image is
    /// available locally. A missing runtime is fatal.
    pub async fn ensure_installed(&self) -> Result<(), GaleError> {
        if run_docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .is_err()
        {
            return Err(GaleError::Config(
                "docker is required but not available — install it and ensure the daemon is running"
                    .into(),
            ));
        }

        if run_docker(&["image", "inspect", &self.cfg.image]).await.is_err() {
            tracing::info!(image = %self.cfg.image, "pulling model server image");
            run_docker_bounded(
                &["pull", &self.cfg.image],
                self.cfg.pull_timeout,
            )
            .await?;
        }
        Ok(())
    }

    /// Idempotent start: a running container that answers the readiness
    /// probe is left alone. Anything else of the same name is replaced.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), GaleError> {
        if self.container_running().await && self.client.is_ready().await {
            tracing::info!(container = %self.cfg.container_name, "model server already running");
            return Ok(());
        }

        let _ = run_docker(&["stop", &self.cfg.container_name]).await;
        let _ = run_docker(&["rm", &self.cfg.container_name]).await;

        tokio::fs::create_dir_all(&self.cfg.data_dir).await?;

        let port_publish = format!("{}:11434", self.cfg.host_port);
        let volume = format!("{}:/root/.ollama", self.cfg.data_dir.display());
        let mut args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &self.cfg.container_name,
            "-p",
            &port_publish,
            "-v",
            &volume,
            "--restart",
            "unless-stopped",
        ];
        if self.nvidia_runtime_available().await {
            tracing::info!("NVIDIA runtime detected, enabling GPU passthrough");
            args.extend_from_slice(&["--gpus", "all"]);
        }
        args.push(&self.cfg.image);

        run_docker(&args).await?;
        tracing::info!(container = %self.cfg.container_name, "model server container launched");

        self.wait_ready(cancel).await
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), GaleError> {
        for attempt in 1..=self.cfg.readiness_attempts {
            if cancel.is_cancelled() {
                return Err(GaleError::Cancelled);
            }
            if self.client.is_ready().await {
                tracing::info!(attempt, "model server ready");
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.readiness_delay) => {}
                _ = cancel.cancelled() => return Err(GaleError::Cancelled),
            }
        }

        let logs = run_docker(&["logs", "--tail", "50", &self.cfg.container_name])
            .await
            .unwrap_or_else(|_| "<no logs available>".into());
        Err(GaleError::ModelServer(format!(
            "model server did not become ready after {} probes; recent logs:\n{logs}",
            self.cfg.readiness_attempts
        )))
    }

    async fn container_running(&self) -> bool {
        let filter = format!("name=^{}$", self.cfg.container_name);
        match run_docker(&["ps", "--filter", &filter, "--format", "{{.Names}}"]).await {
            Ok(out) => out.lines().any(|l| l.trim() == self.cfg.container_name),
            Err(_) => false,
        }
    }

    async fn nvidia_runtime_available(&self) -> bool {
        match run_docker(&["info", "--format", "{{json .Runtimes}}"]).await {
            Ok(out) => out.contains("nvidia"),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------
    // Model pulls
    // -----------------------------------------------------------------

    /// Make every requested model available, pulling the missing ones.
    /// Pulls are serialised through an internal lock.
    pub async fn ensure_models(
        &self,
        models: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), GaleError> {
        for model in models {
            let _guard = self.pull_lock.lock().await;
            let installed = self.installed_models().await?;
            if installed.iter().any(|name| model_matches(name, model)) {
                tracing::debug!(model = %model, "model already installed");
                continue;
            }
            tracing::info!(model = %model, "pulling model");
            self.pull_model(model, cancel).await?;
        }
        Ok(())
    }

    async fn installed_models(&self) -> Result<Vec<String>, GaleError> {
        let tags = self.client.tags().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Capabilities advertised at registration: every configured model,
    /// flagged loaded when the server lists it.
    pub async fn capabilities(&self, configured: &[String]) -> Vec<ModelCapability> {
        let installed = self.installed_models().await.unwrap_or_default();
        configured
            .iter()
            .map(|model| ModelCapability {
                model_name: model.clone(),
                is_loaded: installed.iter().any(|name| model_matches(name, model)),
                max_tokens: DEFAULT_MAX_TOKENS,
            })
            .collect()
    }

    async fn pull_model(&self, model: &str, cancel: &CancellationToken) -> Result<(), GaleError> {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", self.cfg.container_name.as_str(), "ollama", "pull", model])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| GaleError::Subprocess(format!("failed to start model pull: {e}")))?;

        // Both streams are scanned in the background: progress lines go
        // to the log (throttled), everything is kept for error analysis.
        let collected = Arc::new(Mutex::new(String::new()));
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let out_scan = tokio::spawn(scan_pull_output(stdout, Arc::clone(&collected)));
        let err_scan = tokio::spawn(scan_pull_output(stderr, Arc::clone(&collected)));

        enum PullOutcome {
            Done(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => PullOutcome::Done(status),
            _ = tokio::time::sleep(self.cfg.pull_timeout) => PullOutcome::TimedOut,
            _ = cancel.cancelled() => PullOutcome::Cancelled,
        };
        let waited = match outcome {
            PullOutcome::Done(status) => status,
            PullOutcome::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GaleError::Timeout(self.cfg.pull_timeout.as_millis() as u64));
            }
            PullOutcome::Cancelled => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GaleError::Cancelled);
            }
        };
        let _ = out_scan.await;
        let _ = err_scan.await;

        let status =
            waited.map_err(|e| GaleError::Subprocess(format!("waiting on model pull: {e}")))?;
        let output = collected.lock().expect("pull buffer poisoned").clone();

        if status.success() && !mentions_not_found(&output) {
            tracing::info!(model = %model, "model pull complete");
            return Ok(());
        }

        if mentions_not_found(&output) {
            return Err(GaleError::ModelNotFound {
                model: model.to_string(),
                suggestion: pull_suggestion(model),
            });
        }
        Err(GaleError::Subprocess(format!(
            "model pull exited with {}: {}",
            status.code().unwrap_or(-1),
            output.chars().take(500).collect::<String>()
        )))
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Best-effort stop; a missing container is logged, not an error.
    pub async fn stop(&self) {
        if let Err(e) = run_docker(&["stop", &self.cfg.container_name]).await {
            tracing::warn!(container = %self.cfg.container_name, "stop failed: {e}");
        }
    }

    /// Best-effort stop and remove.
    pub async fn cleanup(&self) {
        self.stop().await;
        if let Err(e) = run_docker(&["rm", &self.cfg.container_name]).await {
            tracing::warn!(container = %self.cfg.container_name, "remove failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------

async fn run_docker(args: &[&str]) -> Result<String, GaleError> {
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| GaleError::Subprocess(format!("docker {}: {e}", args.join(" "))))?;

    if !output.status.success() {
        return Err(GaleError::ProcessExit {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_docker_bounded(args: &[&str], limit: Duration) -> Result<String, GaleError> {
    match tokio::time::timeout(limit, run_docker(args)).await {
        Ok(result) => result,
        Err(_) => Err(GaleError::Timeout(limit.as_millis() as u64)),
    }
}

/// Line-scan a pull stream: strip terminal-escape noise and spinner
/// glyphs, log progress at most once per second, and keep the cleaned
/// text for error analysis.
async fn scan_pull_output<R>(pipe: R, collected: Arc<Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    let mut last_logged = Instant::now() - Duration::from_secs(2);

    while let Ok(Some(line)) = lines.next_line().await {
        let cleaned = clean_progress_line(&line);
        if cleaned.is_empty() {
            continue;
        }
        {
            let mut buf = collected.lock().expect("pull buffer poisoned");
            buf.push_str(&cleaned);
            buf.push('\n');
        }
        if last_logged.elapsed() >= Duration::from_secs(1) {
            tracing::info!("pull: {cleaned}");
            last_logged = Instant::now();
        }
    }
}

/// Remove ANSI escape sequences, carriage-return repaints, and spinner
/// glyphs from a progress line.
pub fn clean_progress_line(line: &str) -> String {
    static ANSI: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let ansi = ANSI.get_or_init(|| {
        regex::Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("ansi regex")
    });

    let line = line.rsplit('\r').next().unwrap_or(line);
    let stripped = ansi.replace_all(line, "");
    stripped
        .chars()
        .filter(|c| !SPINNER_GLYPHS.contains(c) && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn mentions_not_found(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("not found") || lower.contains("no such model")
}

/// Map a failed pull to something the operator can act on.
pub fn pull_suggestion(model: &str) -> String {
    const KNOWN_TAGS: &[(&str, &str)] = &[
        ("llama2", "llama2:7b"),
        ("codellama", "codellama:7b"),
        ("mistral", "mistral:7b"),
    ];

    if let Some((_, tagged)) = KNOWN_TAGS.iter().find(|(short, _)| *short == model) {
        return format!("did you mean {tagged}?");
    }
    if !model.contains(':') {
        return format!(
            "try {model}:latest, or a known model such as llama2:7b or codellama:7b"
        );
    }
    "check the model name; known-good models include llama2:7b and codellama:7b".to_string()
}

/// An installed tag satisfies a request for its untagged base name.
fn model_matches(installed: &str, requested: &str) -> bool {
    installed == requested
        || (!requested.contains(':')
            && installed.split(':').next().is_some_and(|base| base == requested))
}
