use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Recovered,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Warning => write!(f, "warning"),
            Severity::Recovered => write!(f, "recovered"),
            Severity::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A best-effort delivery channel. Failures are logged and swallowed;
/// an unreachable sink must never take the engine down with it.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> std::result::Result<(), String>;
}

/// POSTs alerts as JSON to a configured URL.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> std::result::Result<(), String> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", resp.status()))
        }
    }
}

/// Runs a local command with severity and message as arguments, for
/// desktop notifiers like notify-send.
pub struct CommandSink {
    command: String,
}

impl CommandSink {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AlertSink for CommandSink {
    fn name(&self) -> &str {
        "command"
    }

    async fn deliver(&self, alert: &Alert) -> std::result::Result<(), String> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "{} {} {}",
                self.command,
                shell_quote(&alert.severity.to_string()),
                shell_quote(&format!("[{}] {}", alert.target, alert.message)),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("notify command exited with {status}"))
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Fans alerts out to the structured log and every configured sink.
///
/// The log write is the one channel that cannot fail; sink errors are
/// logged at warn and otherwise ignored. Recent alerts are kept in a ring
/// for the status API.
pub struct Notifier {
    sinks: Vec<Arc<dyn AlertSink>>,
    recent: Mutex<VecDeque<Alert>>,
    history: usize,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, history: usize) -> Self {
        Self {
            sinks,
            recent: Mutex::new(VecDeque::new()),
            history,
        }
    }

    pub async fn notify(&self, severity: Severity, target: &str, message: impl Into<String>) {
        let alert = Alert {
            severity,
            target: target.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Critical => {
                tracing::error!(target_name = %alert.target, severity = %severity, "{}", alert.message)
            }
            Severity::Warning => {
                tracing::warn!(target_name = %alert.target, severity = %severity, "{}", alert.message)
            }
            _ => {
                tracing::info!(target_name = %alert.target, severity = %severity, "{}", alert.message)
            }
        }

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&alert).await {
                tracing::warn!(sink = sink.name(), error = %e, "Alert delivery failed");
            }
        }

        let mut recent = self.recent.lock().await;
        recent.push_back(alert);
        while recent.len() > self.history {
            recent.pop_front();
        }
    }

    pub async fn recent(&self) -> Vec<Alert> {
        self.recent.lock().await.iter().cloned().collect()
    }

    pub async fn restore(&self, alerts: Vec<Alert>) {
        let mut recent = self.recent.lock().await;
        *recent = alerts.into_iter().collect();
        while recent.len() > self.history {
            recent.pop_front();
        }
    }
}
