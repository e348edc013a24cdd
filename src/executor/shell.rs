//! Shell task executor: spawns the task's argv directly (no shell
//! interpolation), reads stdout/stderr with a hard byte cap, and kills
//! the whole process group on timeout or cancellation.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::GaleError;
use crate::executor::TaskExecutor;
use crate::model::{Task, TaskResult};

/// Kills the entire process group, not just the leader PID. The child
/// is made a group leader via `process_group(0)`, so grandchildren die
/// with it instead of surviving as orphans.
struct ProcessGroupGuard {
    pid: Option<u32>,
    disarmed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            disarmed: false,
        }
    }

    fn kill(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            self.kill();
        }
    }
}

pub struct ShellExecutor {
    cfg: ExecutorConfig,
}

impl ShellExecutor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GaleError> {
        let argv = &task.config.command;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GaleError::Validation(format!("shell task {} has no command", task.id)))?;

        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(task.config.env.iter().filter_map(|kv| kv.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| GaleError::Subprocess(format!("failed to spawn {program}: {e}")))?;

        let mut guard = ProcessGroupGuard::new(child.id());

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");

        // One extra byte past the cap distinguishes "exactly at the
        // limit" from "over it".
        let read_limit = self.cfg.max_output_bytes as u64 + 1;
        let stdout_reader = tokio::spawn(read_capped(stdout_pipe, read_limit));
        let stderr_reader = tokio::spawn(read_capped(stderr_pipe, read_limit));

        let wait = async {
            let status = child.wait().await;
            let stdout = stdout_reader.await.unwrap_or_default();
            let stderr = stderr_reader.await.unwrap_or_default();
            (status, stdout, stderr)
        };

        let (status, stdout, stderr) = tokio::select! {
            output = wait => output,
            _ = tokio::time::sleep(self.cfg.task_timeout) => {
                guard.kill();
                return Err(GaleError::Timeout(start.elapsed().as_millis() as u64));
            }
            _ = cancel.cancelled() => {
                guard.kill();
                return Err(GaleError::Cancelled);
            }
        };
        guard.disarm();

        let status =
            status.map_err(|e| GaleError::Subprocess(format!("waiting on {program}: {e}")))?;

        if stdout.len() > self.cfg.max_output_bytes || stderr.len() > self.cfg.max_output_bytes {
            return Err(GaleError::Subprocess(format!(
                "task output exceeded {} byte limit",
                self.cfg.max_output_bytes
            )));
        }

        let mut result = TaskResult::new(&task.id);
        result.exit_code = status.code().unwrap_or(-1);
        result.stdout = String::from_utf8_lossy(&stdout).into_owned();
        result.stderr = String::from_utf8_lossy(&stderr).into_owned();
        result.execution_time_ms = start.elapsed().as_millis() as u64;

        if !status.success() {
            tracing::warn!(
                task_id = %task.id,
                code = result.exit_code,
                "shell task exited non-zero"
            );
        }
        Ok(result)
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(pipe: R, limit: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut capped = pipe.take(limit);
    if let Err(e) = capped.read_to_end(&mut buf).await {
        tracing::warn!("pipe read error: {e}");
    }
    buf
}
