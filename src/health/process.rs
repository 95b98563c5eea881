use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::TargetConfig;
use crate::error::{OverseerError, Result};

/// Process substrate for starting and stopping service targets.
///
/// The engine only ever talks to this trait; tests substitute a fake so
/// restart policy can be exercised without touching real processes.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Stop whatever is serving the target's port. Succeeds if nothing is.
    async fn stop(&self, target: &TargetConfig) -> Result<()>;

    /// Launch the target's start command, detached.
    async fn start(&self, target: &TargetConfig) -> Result<()>;
}

/// Real implementation: finds the listener by port and relaunches via the
/// configured shell command.
#[derive(Debug, Default)]
pub struct ShellProcessControl;

#[async_trait]
impl ProcessControl for ShellProcessControl {
    async fn stop(&self, target: &TargetConfig) -> Result<()> {
        let output = Command::new("lsof")
            .args(["-t", "-i", &format!(":{}", target.port)])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;

        let pids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if pids.is_empty() {
            tracing::debug!(target = %target.name, port = target.port, "Nothing listening, stop is a no-op");
            return Ok(());
        }

        for pid in &pids {
            tracing::info!(target = %target.name, pid = %pid, "Stopping process");
            let killed = Command::new("kill").arg(pid).status().await?;
            if !killed.success() {
                return Err(OverseerError::Internal(format!(
                    "kill {pid} exited with {killed}"
                )));
            }
        }
        Ok(())
    }

    async fn start(&self, target: &TargetConfig) -> Result<()> {
        tracing::info!(target = %target.name, command = %target.start_command, "Starting process");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&target.start_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &target.workdir {
            cmd.current_dir(dir);
        }
        cmd.spawn()?;
        Ok(())
    }
}
