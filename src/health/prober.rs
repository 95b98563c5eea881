use std::time::Duration;

use crate::config::{ProbeConfig, TargetConfig};

/// Outcome of a single health probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: String,
    pub success: bool,
    pub latency_ms: u64,
    pub detail: String,
}

/// Probes target health endpoints over HTTP.
///
/// A probe succeeds on a 2xx response whose body, if it parses as JSON,
/// reports `"status": "healthy"` or `"ok"`. Non-JSON 2xx bodies pass; any
/// transport error, timeout, or non-2xx status fails.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new(config: &ProbeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn probe(&self, target: &TargetConfig) -> ProbeResult {
        let started = std::time::Instant::now();
        let response = self.client.get(&target.health_url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if !status.is_success() {
                    return ProbeResult {
                        target: target.name.clone(),
                        success: false,
                        latency_ms,
                        detail: format!("HTTP {status}"),
                    };
                }
                let body = resp.text().await.unwrap_or_default();
                let success = Self::body_is_healthy(&body);
                ProbeResult {
                    target: target.name.clone(),
                    success,
                    latency_ms,
                    detail: if success {
                        format!("HTTP {status}")
                    } else {
                        format!("HTTP {status}, unhealthy body")
                    },
                }
            }
            Err(e) => ProbeResult {
                target: target.name.clone(),
                success: false,
                latency_ms,
                detail: if e.is_timeout() {
                    "probe timed out".to_string()
                } else {
                    e.to_string()
                },
            },
        }
    }

    fn body_is_healthy(body: &str) -> bool {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(json) => match json.get("status").and_then(|s| s.as_str()) {
                Some(status) => matches!(status, "healthy" | "ok"),
                // JSON without a status field; trust the 2xx
                None => true,
            },
            // not JSON; trust the 2xx
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_status_values() {
        assert!(HealthProber::body_is_healthy(r#"{"status":"healthy"}"#));
        assert!(HealthProber::body_is_healthy(r#"{"status":"ok"}"#));
        assert!(!HealthProber::body_is_healthy(r#"{"status":"degraded"}"#));
    }

    #[test]
    fn non_json_body_passes() {
        assert!(HealthProber::body_is_healthy("OK"));
        assert!(HealthProber::body_is_healthy(""));
    }

    #[test]
    fn json_without_status_passes() {
        assert!(HealthProber::body_is_healthy(r#"{"uptime": 12}"#));
    }
}
