use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OverseerError, Result};

/// Health probing configuration shared by all targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Seconds between probe cycles
    pub interval_secs: u64,
    /// Per-request timeout; a probe that exceeds it counts as a failure
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            timeout_secs: 10,
        }
    }
}

/// Restart governor configuration.
///
/// Every threshold lives here rather than in code so operators can tune
/// failure tolerance per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Consecutive probe failures before a restart is attempted
    pub max_failures: u32,
    /// Consecutive failures that raise a warning alert
    pub warn_after: u32,
    /// Restarts allowed inside `window_secs` before the circuit opens
    pub max_restarts_per_window: u32,
    /// Sliding window for counting restarts
    pub window_secs: u64,
    /// With no new failures for this long, an open circuit closes on its own
    pub cooldown_secs: u64,
    /// Consecutive successful probes required to call a restart verified
    pub verify_probes: u32,
    /// Wait after launching a process before probing it
    pub startup_delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            warn_after: 2,
            max_restarts_per_window: 3,
            window_secs: 3600,
            cooldown_secs: 1800,
            verify_probes: 3,
            startup_delay_ms: 5000,
        }
    }
}

/// A monitored service target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name, also used in API paths and alerts
    pub name: String,
    /// TCP port the service listens on; used to find the process to stop
    pub port: u16,
    /// Full URL probed for health, e.g. `http://127.0.0.1:8400/health`
    pub health_url: String,
    /// Shell command that starts the service
    pub start_command: String,
    /// Working directory for `start_command`
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// When false the governor observes but never restarts
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

fn default_true() -> bool {
    true
}

/// One promotion edge between two environments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Edge name, e.g. `dev-qa`
    pub name: String,
    /// Branch commits are promoted from
    pub source_branch: String,
    /// Branch commits are promoted into
    pub target_branch: String,
    /// Repository the branches live in
    pub repo_path: PathBuf,
    /// Accumulated commits that trigger a promotion
    pub commit_threshold: u64,
    /// Accumulated feature commits that trigger a promotion
    pub feature_threshold: u64,
    /// Commit-subject prefix that marks a feature commit
    #[serde(default = "default_feature_marker")]
    pub feature_marker: String,
    /// Shell commands that must all exit 0 before the merge lands
    #[serde(default)]
    pub gate_commands: Vec<String>,
    /// Shell command that backs up the target environment state; its stdout
    /// is kept as the restore handle
    #[serde(default)]
    pub backup_command: Option<String>,
    /// Shell command that applies migrations in the target environment
    #[serde(default)]
    pub migrate_command: Option<String>,
    /// Shell command that restores from a backup handle passed as `$1`
    #[serde(default)]
    pub restore_command: Option<String>,
    /// Service target restarted and verified after the merge
    #[serde(default)]
    pub service: Option<String>,
    /// Target whose circuit must be closed before this edge may promote
    #[serde(default)]
    pub requires_healthy: Option<String>,
    /// Edge whose most recent promotion must have succeeded first,
    /// e.g. qa-prod requires dev-qa
    #[serde(default)]
    pub requires_success_of: Option<String>,
    /// Prefix for auto-incremented tags, e.g. `v`
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

fn default_feature_marker() -> String {
    "feat".to_string()
}

fn default_tag_prefix() -> String {
    "v".to_string()
}

/// Retry backoff for failed tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a task is dead-lettered
    pub max_retries: u32,
    /// First retry delay
    pub base_delay_ms: u64,
    /// Multiplier applied per additional attempt
    pub multiplier: f64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_addr: SocketAddr,
    /// Snapshot file the engine persists its state to
    pub state_file: PathBuf,
    /// Pid file written by `overseer start`
    pub pid_file: PathBuf,
    /// Milliseconds between assignment passes
    pub assign_interval_ms: u64,
    /// A session missing heartbeats for this long is marked offline
    pub heartbeat_grace_ms: u64,
    /// In-progress tasks reclaimed after this long without progress
    pub visibility_timeout_secs: u64,
    /// Seconds between promotion-threshold evaluations
    pub promotion_interval_secs: u64,
    /// Seconds between state snapshots
    pub persist_interval_secs: u64,
    pub probe: ProbeConfig,
    pub restart: RestartConfig,
    pub retry: RetryConfig,
    pub targets: Vec<TargetConfig>,
    pub edges: Vec<EdgeConfig>,
    /// Webhook POSTed alert payloads, when set
    pub webhook_url: Option<String>,
    /// Command invoked with severity and message for desktop notifications
    pub notify_command: Option<String>,
    /// Alerts retained in the in-memory ring for the status API
    pub alert_history: usize,
    /// Promotion events retained in memory and in the snapshot
    pub promotion_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8700"
                .parse()
                .expect("default listen address is valid"),
            state_file: PathBuf::from("overseer_state.json"),
            pid_file: PathBuf::from("overseer.pid"),
            assign_interval_ms: 1000,
            heartbeat_grace_ms: 90_000,
            visibility_timeout_secs: 600,
            promotion_interval_secs: 60,
            persist_interval_secs: 30,
            probe: ProbeConfig::default(),
            restart: RestartConfig::default(),
            retry: RetryConfig::default(),
            targets: Vec::new(),
            edges: Vec::new(),
            webhook_url: None,
            notify_command: None,
            alert_history: 200,
            promotion_history: 200,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.targets.len() {
            return Err(OverseerError::Config("duplicate target names".into()));
        }
        for edge in &self.edges {
            if edge.commit_threshold == 0 && edge.feature_threshold == 0 {
                return Err(OverseerError::Config(format!(
                    "edge {} has no trigger thresholds",
                    edge.name
                )));
            }
            if let Some(service) = &edge.service {
                if !self.targets.iter().any(|t| &t.name == service) {
                    return Err(OverseerError::Config(format!(
                        "edge {} references unknown service {}",
                        edge.name, service
                    )));
                }
            }
            if let Some(required) = &edge.requires_success_of {
                if !self.edges.iter().any(|e| &e.name == required) {
                    return Err(OverseerError::Config(format!(
                        "edge {} requires unknown edge {}",
                        edge.name, required
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_edge(mut self, edge: EdgeConfig) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeConfig> {
        self.edges.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            port: 8400,
            health_url: "http://127.0.0.1:8400/health".to_string(),
            start_command: "./run.sh".to_string(),
            workdir: None,
            auto_restart: true,
        }
    }

    fn edge(name: &str) -> EdgeConfig {
        EdgeConfig {
            name: name.to_string(),
            source_branch: "dev".to_string(),
            target_branch: "qa".to_string(),
            repo_path: PathBuf::from("/srv/repo"),
            commit_threshold: 3,
            feature_threshold: 2,
            feature_marker: default_feature_marker(),
            gate_commands: vec![],
            backup_command: None,
            migrate_command: None,
            restore_command: None,
            service: None,
            requires_healthy: None,
            requires_success_of: None,
            tag_prefix: default_tag_prefix(),
        }
    }

    #[test]
    fn restart_config_default() {
        let cfg = RestartConfig::default();
        assert_eq!(cfg.max_failures, 3);
        assert_eq!(cfg.max_restarts_per_window, 3);
        assert_eq!(cfg.window_secs, 3600);
        assert_eq!(cfg.cooldown_secs, 1800);
        assert_eq!(cfg.verify_probes, 3);
    }

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8700");
        assert!(cfg.targets.is_empty());
        assert!(cfg.edges.is_empty());
        assert_eq!(cfg.retry.max_retries, 3);
    }

    #[test]
    fn engine_config_builders() {
        let cfg = EngineConfig::default()
            .with_target(target("api"))
            .with_edge(edge("dev-qa"));
        assert!(cfg.target("api").is_some());
        assert!(cfg.target("web").is_none());
        assert!(cfg.edge("dev-qa").is_some());
    }

    #[test]
    fn validate_rejects_duplicate_targets() {
        let cfg = EngineConfig::default()
            .with_target(target("api"))
            .with_target(target("api"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut e = edge("dev-qa");
        e.commit_threshold = 0;
        e.feature_threshold = 0;
        let cfg = EngineConfig::default().with_edge(e);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_service_reference() {
        let mut e = edge("dev-qa");
        e.service = Some("ghost".to_string());
        let cfg = EngineConfig::default().with_edge(e);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_required_edge() {
        let mut e = edge("qa-prod");
        e.requires_success_of = Some("dev-qa".to_string());
        let cfg = EngineConfig::default().with_edge(e);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_parses_partial_json() {
        let raw = r#"{ "assign_interval_ms": 250, "restart": { "max_failures": 5 } }"#;
        let cfg: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.assign_interval_ms, 250);
        assert_eq!(cfg.restart.max_failures, 5);
        assert_eq!(cfg.restart.max_restarts_per_window, 3);
    }
}
