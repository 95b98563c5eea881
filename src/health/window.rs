use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sliding window of failure and restart timestamps for one target.
///
/// Every operation takes `now` explicitly so the circuit logic can be
/// exercised in tests without waiting out real clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureWindow {
    window_secs: u64,
    failures: VecDeque<DateTime<Utc>>,
    restarts: VecDeque<DateTime<Utc>>,
}

impl FailureWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            failures: VecDeque::new(),
            restarts: VecDeque::new(),
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures.push_back(now);
        self.prune(now);
    }

    pub fn record_restart(&mut self, now: DateTime<Utc>) {
        self.restarts.push_back(now);
        self.prune(now);
    }

    pub fn failure_count(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.failures.len() as u32
    }

    pub fn restart_count(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.restarts.len() as u32
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.failures.back().copied()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
        self.restarts.clear();
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs as i64);
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }
        while self.restarts.front().is_some_and(|t| *t < cutoff) {
            self.restarts.pop_front();
        }
    }
}
