//! Shell command runner used by `RUN_COMMAND`.
//!
//! Commands run through `sh -c` inside the selected folder with stdout and
//! stderr captured in full. There is no timeout; the child is killed when the
//! future running it is dropped (turn cancelled).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Captured result of one process run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status; `-1` if the process could not be started or was killed by a signal
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Runs a command string to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path) -> ProcessOutput;
}

/// Default runner: `sh -c <command>` (`cmd /C` on Windows).
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, command: &str, cwd: &Path) -> ProcessOutput {
        execute_command(command, cwd).await
    }
}

pub async fn execute_command(cmd: &str, cwd: &Path) -> ProcessOutput {
    let start = Instant::now();

    let (shell, shell_arg) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let output = Command::new(shell)
        .arg(shell_arg)
        .arg(cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match output {
        Ok(output) => {
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::debug!(command = cmd, exit_code, duration_ms, "command finished");
            ProcessOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code,
                duration_ms,
            }
        }
        Err(e) => {
            tracing::warn!(command = cmd, "failed to start command: {}", e);
            ProcessOutput {
                stdout: String::new(),
                stderr: format!("Failed to execute: {}", e),
                exit_code: -1,
                duration_ms,
            }
        }
    }
}
