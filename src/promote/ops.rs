use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{EdgeConfig, ProbeConfig, RestartConfig, TargetConfig};
use crate::error::{OverseerError, Result};
use crate::health::{HealthProber, ProcessControl};

/// Pre-merge quality gates for an edge.
#[async_trait]
pub trait GateRunner: Send + Sync {
    /// Run every gate; the first failure aborts with its diagnostic.
    async fn run_gates(&self, edge: &EdgeConfig) -> Result<()>;
}

/// Migration lifecycle around a promotion.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Back up target-environment state; returns a handle for `restore`.
    async fn backup(&self, edge: &EdgeConfig) -> Result<Option<String>>;

    async fn apply(&self, edge: &EdgeConfig) -> Result<()>;

    async fn restore(&self, edge: &EdgeConfig, handle: &str) -> Result<()>;
}

/// Restarts the promoted service and confirms it settles healthy.
#[async_trait]
pub trait ServiceVerifier: Send + Sync {
    async fn restart_and_verify(&self, target: &TargetConfig) -> Result<()>;
}

async fn sh(edge: &EdgeConfig, command: &str, arg: Option<&str>) -> Result<std::process::Output> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(arg) = arg {
        // exposed to the command as $1
        cmd.arg("sh").arg(arg);
    }
    cmd.current_dir(&edge.repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(cmd.output().await?)
}

/// Gates as configured shell commands.
#[derive(Debug, Default)]
pub struct CommandGates;

#[async_trait]
impl GateRunner for CommandGates {
    async fn run_gates(&self, edge: &EdgeConfig) -> Result<()> {
        for command in &edge.gate_commands {
            tracing::info!(edge = %edge.name, command = %command, "Running gate");
            let output = sh(edge, command, None).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(OverseerError::GateFailed(format!(
                    "{command}: {}",
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

/// Migrations as configured shell commands. Edges without commands treat
/// every step as a successful no-op.
#[derive(Debug, Default)]
pub struct CommandMigrator;

#[async_trait]
impl MigrationRunner for CommandMigrator {
    async fn backup(&self, edge: &EdgeConfig) -> Result<Option<String>> {
        let Some(command) = &edge.backup_command else {
            return Ok(None);
        };
        let output = sh(edge, command, None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OverseerError::Migration(format!(
                "backup failed: {}",
                stderr.trim()
            )));
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn apply(&self, edge: &EdgeConfig) -> Result<()> {
        let Some(command) = &edge.migrate_command else {
            return Ok(());
        };
        let output = sh(edge, command, None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OverseerError::Migration(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn restore(&self, edge: &EdgeConfig, handle: &str) -> Result<()> {
        let Some(command) = &edge.restore_command else {
            return Ok(());
        };
        let output = sh(edge, command, Some(handle)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OverseerError::Migration(format!(
                "restore failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Real verifier: bounce the process, wait out the startup delay, then
/// require consecutive healthy probes.
pub struct RestartVerifier {
    process: Arc<dyn ProcessControl>,
    prober: HealthProber,
    restart: RestartConfig,
    probe_interval: Duration,
}

impl RestartVerifier {
    pub fn new(process: Arc<dyn ProcessControl>, probe: &ProbeConfig, restart: RestartConfig) -> Self {
        Self {
            process,
            prober: HealthProber::new(probe),
            restart,
            // verification probes poll faster than the main loop
            probe_interval: Duration::from_secs(probe.timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ServiceVerifier for RestartVerifier {
    async fn restart_and_verify(&self, target: &TargetConfig) -> Result<()> {
        self.process.stop(target).await?;
        self.process.start(target).await?;
        tokio::time::sleep(Duration::from_millis(self.restart.startup_delay_ms)).await;

        let mut healthy = 0;
        let attempts = self.restart.verify_probes * 2;
        for _ in 0..attempts {
            let result = self.prober.probe(target).await;
            if result.success {
                healthy += 1;
                if healthy >= self.restart.verify_probes {
                    return Ok(());
                }
            } else {
                healthy = 0;
            }
            tokio::time::sleep(self.probe_interval).await;
        }
        Err(OverseerError::VerificationFailed(format!(
            "{} did not reach {} consecutive healthy probes",
            target.name, self.restart.verify_probes
        )))
    }
}
