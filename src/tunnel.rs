//! Tunnel supervisor: exposes the local webhook port through an
//! external `bore` process and discovers the public address by parsing
//! the child's stdout. The pattern list is ordered; the first match
//! wins. Structured output would be preferable, but the upstream tool
//! only talks through its log lines, so the regexes stay as an ordered
//! fallback chain.

use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::error::GaleError;

const INSTALL_HELP: &str = "install it manually: https://github.com/ekzhang/bore";

/// A public address extracted from one stdout line. The host is absent
/// when only a remote port was announced; the configured tunnel server
/// fills the gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicAddr {
    pub host: Option<String>,
    pub port: u16,
}

pub struct TunnelSupervisor {
    cfg: TunnelConfig,
    child: Option<Child>,
    public_url: Option<String>,
}

impl TunnelSupervisor {
    pub fn new(cfg: TunnelConfig) -> Self {
        Self {
            cfg,
            child: None,
            public_url: None,
        }
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    /// Launch the tunnel and wait for the public URL, bounded by the
    /// configured startup timeout. Stderr is scanned concurrently; any
    /// line that smells like a refusal aborts startup.
    pub async fn start(
        &mut self,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<String, GaleError> {
        self.ensure_binary().await?;

        let port_arg = local_port.to_string();
        let mut args: Vec<String> = vec![
            "local".into(),
            port_arg,
            "--to".into(),
            self.cfg.server.clone(),
        ];
        if let Some(remote) = self.cfg.remote_port {
            args.push("--port".into());
            args.push(remote.to_string());
        }
        if let Some(ref secret) = self.cfg.secret {
            args.push("--secret".into());
            args.push(secret.clone());
        }

        let mut child = Command::new(&self.cfg.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GaleError::Subprocess(format!("failed to spawn {}: {e}", self.cfg.binary))
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (url_tx, mut url_rx) = mpsc::channel::<PublicAddr>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<String>(1);

        // Readers outlive startup: the tunnel keeps logging for its
        // whole lifetime and the pipes must be drained.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "tunnel", "{line}");
                if let Some(addr) = extract_public_addr(&line) {
                    let _ = url_tx.try_send(addr);
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "tunnel", "{line}");
                if is_failure_line(&line) {
                    let _ = err_tx.try_send(line);
                }
            }
        });

        enum Startup {
            Announced(PublicAddr),
            Refused(String),
            Exited(i32),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            Some(addr) = url_rx.recv() => Startup::Announced(addr),
            Some(line) = err_rx.recv() => Startup::Refused(line),
            status = child.wait() => {
                Startup::Exited(status.ok().and_then(|s| s.code()).unwrap_or(-1))
            }
            _ = tokio::time::sleep(self.cfg.startup_timeout) => Startup::TimedOut,
            _ = cancel.cancelled() => Startup::Cancelled,
        };

        let addr = match outcome {
            Startup::Announced(addr) => addr,
            Startup::Refused(line) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GaleError::Subprocess(format!("tunnel reported: {line}")));
            }
            Startup::Exited(code) => {
                return Err(GaleError::Subprocess(format!(
                    "tunnel exited with code {code} before announcing a public address"
                )));
            }
            Startup::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GaleError::Timeout(self.cfg.startup_timeout.as_millis() as u64));
            }
            Startup::Cancelled => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GaleError::Cancelled);
            }
        };

        let host = addr.host.unwrap_or_else(|| self.cfg.server.clone());
        let url = format!("http://{host}:{}/webhook", addr.port);
        tracing::info!(url = %url, "tunnel established");

        self.child = Some(child);
        self.public_url = Some(url.clone());
        Ok(url)
    }

    /// Kill the child and wait for it.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::warn!("tunnel kill failed: {e}");
            }
            if let Err(e) = child.wait().await {
                tracing::warn!("tunnel wait failed: {e}");
            }
            tracing::info!("tunnel stopped");
        }
        self.public_url = None;
    }

    /// Resolve the tunnel binary, installing it when absent. The
    /// install path mirrors how the tool itself is distributed.
    async fn ensure_binary(&self) -> Result<(), GaleError> {
        let probe = Command::new(&self.cfg.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if probe.is_ok() {
            return Ok(());
        }

        tracing::info!(binary = %self.cfg.binary, "tunnel binary missing, attempting install");
        let installed = Command::new("cargo")
            .args(["install", "bore-cli"])
            .status()
            .await;
        match installed {
            Ok(status) if status.success() => Ok(()),
            _ => Err(GaleError::Config(format!(
                "tunnel binary {:?} is not available and automatic install failed; {INSTALL_HELP}",
                self.cfg.binary
            ))),
        }
    }
}

// ---------------------------------------------------------------------
// Stdout parsing
// ---------------------------------------------------------------------

struct AddrPattern {
    regex: Regex,
    has_host: bool,
}

fn patterns() -> &'static [AddrPattern] {
    static PATTERNS: OnceLock<Vec<AddrPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let host_port = [
            r"listening at ([A-Za-z0-9.\-]+):(\d{2,5})",
            r"server listening .*?([A-Za-z0-9.\-]+):(\d{2,5})",
            r"tunnel .*?([A-Za-z0-9.\-]+):(\d{2,5})",
        ];
        let port_only = [
            r"connected to server .*?remote_port=(\d{2,5})",
            r"INFO .*?connected .*?remote_port=(\d{2,5})",
        ];
        let trailing_host_port = [r"bore-cli.*?listening.*?([A-Za-z0-9.\-]+):(\d{2,5})"];

        let mut list = Vec::new();
        for p in host_port {
            list.push(AddrPattern {
                regex: Regex::new(p).expect("tunnel pattern"),
                has_host: true,
            });
        }
        for p in port_only {
            list.push(AddrPattern {
                regex: Regex::new(p).expect("tunnel pattern"),
                has_host: false,
            });
        }
        for p in trailing_host_port {
            list.push(AddrPattern {
                regex: Regex::new(p).expect("tunnel pattern"),
                has_host: true,
            });
        }
        list
    })
}

/// Ordered-pattern extraction of the announced public address. Lines
/// that merely hint at a connection fall back to scanning for a
/// `remote_port=` assignment, then for any 4-5 digit integer.
pub fn extract_public_addr(line: &str) -> Option<PublicAddr> {
    for pattern in patterns() {
        if let Some(caps) = pattern.regex.captures(line) {
            if pattern.has_host {
                let host = caps.get(1)?.as_str();
                if let Ok(port) = caps.get(2)?.as_str().parse::<u16>() {
                    return Some(PublicAddr {
                        host: Some(host.to_string()),
                        port,
                    });
                }
            } else if let Ok(port) = caps.get(1)?.as_str().parse::<u16>() {
                return Some(PublicAddr { host: None, port });
            }
        }
    }

    let hinted = ["listening", "remote_port", "connected"]
        .iter()
        .any(|needle| line.contains(needle));
    if !hinted {
        return None;
    }

    static REMOTE_PORT: OnceLock<Regex> = OnceLock::new();
    let remote_port =
        REMOTE_PORT.get_or_init(|| Regex::new(r"remote_port.*?=.*?(\d{4,5})").expect("port regex"));
    if let Some(caps) = remote_port.captures(line)
        && let Ok(port) = caps[1].parse::<u16>()
    {
        return Some(PublicAddr { host: None, port });
    }

    static ANY_PORT: OnceLock<Regex> = OnceLock::new();
    let any_port = ANY_PORT.get_or_init(|| Regex::new(r"\b(\d{4,5})\b").expect("port regex"));
    for caps in any_port.captures_iter(line) {
        if let Ok(port) = caps[1].parse::<u16>() {
            return Some(PublicAddr { host: None, port });
        }
    }
    None
}

fn is_failure_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ["error", "failed", "refused"]
        .iter()
        .any(|needle| lower.contains(needle))
}
