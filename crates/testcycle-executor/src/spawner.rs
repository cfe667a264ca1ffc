use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use crate::{CommandOutput, ExecutorConfig, ExecutorError};

/// Utility for spawning collaborator processes through the shell
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Run `command` with `sh -c`, honoring the working directory, extra
    /// environment and timeout from `config`. The child is killed when the
    /// timeout elapses.
    pub async fn spawn(
        command: &str,
        config: &ExecutorConfig,
        extra_env: &[(&str, String)],
    ) -> Result<CommandOutput, ExecutorError> {
        debug!(
            command,
            working_dir = %config.working_dir.display(),
            timeout = ?config.timeout,
            "Spawning collaborator process"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&config.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;

        match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, Self::collect(child)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command, ?limit, "Collaborator process timed out");
                    Err(ExecutorError::Timeout(limit))
                }
            },
            None => Self::collect(child).await,
        }
    }

    async fn collect(mut child: Child) -> Result<CommandOutput, ExecutorError> {
        let start = Instant::now();

        let stdout_handle = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::ExecutionFailed("stdout not captured".into()))?;
        let stderr_handle = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::ExecutionFailed("stderr not captured".into()))?;

        let mut stdout_reader = BufReader::new(stdout_handle).lines();
        let mut stderr_reader = BufReader::new(stderr_handle).lines();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                biased;

                result = stdout_reader.next_line(), if !stdout_done => {
                    match result {
                        Ok(Some(line)) => {
                            trace!(line = %line, "stdout");
                            push_line(&mut stdout, &line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            return Err(ExecutorError::ExecutionFailed(format!(
                                "Failed to read stdout: {}",
                                e
                            )));
                        }
                    }
                }
                result = stderr_reader.next_line(), if !stderr_done => {
                    match result {
                        Ok(Some(line)) => {
                            trace!(line = %line, "stderr");
                            push_line(&mut stderr, &line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            return Err(ExecutorError::ExecutionFailed(format!(
                                "Failed to read stderr: {}",
                                e
                            )));
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        let duration = start.elapsed();

        debug!(
            exit_code = status.code().unwrap_or(-1),
            duration_ms = duration.as_millis(),
            "Collaborator process completed"
        );

        Ok(CommandOutput::new(
            stdout,
            stderr,
            status.code().unwrap_or(-1),
            duration,
        ))
    }
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}
