use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

use super::record::StepLog;
use crate::excerpt;

const ERROR_OUTPUT_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turns a non-zero exit into an error carrying the tail of stderr.
    ///
    /// # Errors
    /// Returns an error if the command exited unsuccessfully.
    pub fn into_checked(self, display: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }

        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        bail!(
            "{display} failed ({}): {}",
            self.status,
            excerpt::tail(detail, ERROR_OUTPUT_CHARS)
        )
    }
}

/// Runs `command` to completion with a hard time limit, recording it in `log`. The
/// child is killed if the limit is hit.
///
/// # Errors
/// Returns an error if the command cannot be spawned or does not finish in time. A
/// non-zero exit is reported through `CommandOutput::success`, not as an error.
pub async fn run(
    mut command: Command,
    display: &str,
    timeout: Duration,
    log: &mut StepLog,
) -> Result<CommandOutput> {
    log.command(display);
    let shown = display;
    debug!(command = %shown, "running command");

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .with_context(|| format!("failed to execute {display}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("failed waiting for {display}"))?,
        Err(_) => {
            log.note(format!("  -> killed after {}s", timeout.as_secs()));
            return Err(anyhow!(
                "{display} did not finish within {}s",
                timeout.as_secs()
            ));
        }
    };

    let status = output.status.code().map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exit {code}"),
    );
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    log.output(&status, &stdout, &stderr);

    Ok(CommandOutput {
        success: output.status.success(),
        status,
        stdout,
        stderr,
    })
}

/// Like [`run`] but treats a non-zero exit as an error.
///
/// # Errors
/// Returns an error if the command cannot run, times out, or exits unsuccessfully.
pub async fn run_checked(
    command: Command,
    display: &str,
    timeout: Duration,
    log: &mut StepLog,
) -> Result<CommandOutput> {
    run(command, display, timeout, log)
        .await?
        .into_checked(display)
}
