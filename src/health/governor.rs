use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RestartConfig;
use crate::health::window::FailureWindow;

/// Health state of one monitored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TargetHealth {
    Healthy,
    Degraded { failures: u32 },
    Restarting,
    /// Circuit open: restarts are suppressed until reset or cooldown.
    Blocked,
}

impl std::fmt::Display for TargetHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetHealth::Healthy => write!(f, "healthy"),
            TargetHealth::Degraded { failures } => write!(f, "degraded({failures})"),
            TargetHealth::Restarting => write!(f, "restarting"),
            TargetHealth::Blocked => write!(f, "blocked"),
        }
    }
}

/// What the engine should do after feeding a probe result in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do this cycle
    Observe,
    /// Stop and relaunch the target, then report back with `record_restart_outcome`
    Restart,
}

/// State changes the engine should surface as alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorEvent {
    Warned { failures: u32 },
    Recovered,
    CircuitOpened,
    CircuitClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub health: TargetHealth,
    pub window: FailureWindow,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub escalated: bool,
}

#[derive(Debug)]
pub struct Assessment {
    pub decision: Decision,
    pub events: Vec<GovernorEvent>,
}

impl Assessment {
    fn observe(events: Vec<GovernorEvent>) -> Self {
        Self {
            decision: Decision::Observe,
            events,
        }
    }
}

/// Decides when failing targets get restarted and when the circuit opens.
///
/// Pure state machine: all I/O (probing, process control, alert delivery)
/// lives in the engine. Time arrives as an argument.
#[derive(Debug)]
pub struct RestartGovernor {
    config: RestartConfig,
    targets: HashMap<String, TargetState>,
}

impl RestartGovernor {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            targets: HashMap::new(),
        }
    }

    /// Start tracking a target. Idempotent; existing state is kept.
    pub fn track(&mut self, name: &str, auto_restart: bool) {
        self.targets.entry(name.to_string()).or_insert(TargetState {
            health: TargetHealth::Healthy,
            window: FailureWindow::new(self.config.window_secs),
            auto_restart,
            escalated: false,
        });
    }

    pub fn health_of(&self, name: &str) -> Option<TargetHealth> {
        self.targets.get(name).map(|t| t.health)
    }

    pub fn states(&self) -> &HashMap<String, TargetState> {
        &self.targets
    }

    /// Feed one probe result in and get the next action out.
    pub fn record_probe(&mut self, name: &str, success: bool, now: DateTime<Utc>) -> Assessment {
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);
        let Some(target) = self.targets.get_mut(name) else {
            return Assessment::observe(vec![]);
        };

        if success {
            return match target.health {
                TargetHealth::Healthy => Assessment::observe(vec![]),
                TargetHealth::Degraded { .. } => {
                    target.health = TargetHealth::Healthy;
                    Assessment::observe(vec![GovernorEvent::Recovered])
                }
                // A crash mid-restart left us here; the service came back anyway.
                TargetHealth::Restarting => {
                    target.health = TargetHealth::Healthy;
                    Assessment::observe(vec![GovernorEvent::Recovered])
                }
                TargetHealth::Blocked => {
                    let quiet = target
                        .window
                        .last_failure()
                        .map_or(true, |t| now - t >= cooldown);
                    if quiet {
                        target.health = TargetHealth::Healthy;
                        target.escalated = false;
                        target.window.clear();
                        Assessment::observe(vec![
                            GovernorEvent::CircuitClosed,
                            GovernorEvent::Recovered,
                        ])
                    } else {
                        Assessment::observe(vec![])
                    }
                }
            };
        }

        target.window.record_failure(now);
        let failures = match target.health {
            TargetHealth::Healthy => 1,
            TargetHealth::Degraded { failures } => failures + 1,
            // Restart was interrupted before its outcome was recorded.
            TargetHealth::Restarting => self.config.max_failures,
            TargetHealth::Blocked => {
                // Failures while blocked only push the cooldown out.
                return Assessment::observe(vec![]);
            }
        };

        let mut events = Vec::new();
        if failures == self.config.warn_after && failures < self.config.max_failures {
            events.push(GovernorEvent::Warned { failures });
        }

        if failures < self.config.max_failures {
            target.health = TargetHealth::Degraded { failures };
            return Assessment::observe(events);
        }

        if !target.auto_restart {
            target.health = TargetHealth::Degraded { failures };
            if failures == self.config.max_failures {
                events.push(GovernorEvent::Warned { failures });
            }
            return Assessment::observe(events);
        }

        if target.window.restart_count(now) >= self.config.max_restarts_per_window {
            target.health = TargetHealth::Blocked;
            if !target.escalated {
                target.escalated = true;
                events.push(GovernorEvent::CircuitOpened);
            }
            return Assessment::observe(events);
        }

        target.health = TargetHealth::Restarting;
        target.window.record_restart(now);
        tracing::info!(target = name, failures, "Restart threshold reached");
        Assessment {
            decision: Decision::Restart,
            events,
        }
    }

    /// Report whether the restart brought the target back.
    pub fn record_restart_outcome(
        &mut self,
        name: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Assessment {
        let Some(target) = self.targets.get_mut(name) else {
            return Assessment::observe(vec![]);
        };
        if success {
            target.health = TargetHealth::Healthy;
            Assessment::observe(vec![GovernorEvent::Recovered])
        } else {
            // Counts as a fresh failure; the next probe cycle re-evaluates
            // and either restarts again or trips the circuit.
            target.window.record_failure(now);
            target.health = TargetHealth::Degraded {
                failures: self.config.max_failures,
            };
            Assessment::observe(vec![])
        }
    }

    /// Operator reset: close the circuit and forget the window.
    pub fn reset(&mut self, name: &str) -> bool {
        match self.targets.get_mut(name) {
            Some(target) => {
                let was_blocked = target.health == TargetHealth::Blocked;
                target.health = TargetHealth::Healthy;
                target.escalated = false;
                target.window.clear();
                tracing::info!(target = name, "Circuit manually reset");
                was_blocked
            }
            None => false,
        }
    }

    /// Restore per-target state from a snapshot, keeping only known targets.
    pub fn restore(&mut self, states: HashMap<String, TargetState>) {
        for (name, state) in states {
            if let Some(existing) = self.targets.get_mut(&name) {
                let auto_restart = existing.auto_restart;
                *existing = state;
                existing.auto_restart = auto_restart;
                // Never resume mid-restart after a reload.
                if existing.health == TargetHealth::Restarting {
                    existing.health = TargetHealth::Degraded {
                        failures: self.config.max_failures,
                    };
                }
            }
        }
    }
}
