use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::health::governor::TargetState;
use crate::notify::Alert;
use crate::promote::{PromotionEvent, ThresholdCounter};
use crate::scheduler::{Session, Task};

/// Everything the engine persists across restarts.
///
/// Session liveness is deliberately absent: restored sessions come back
/// offline and must heartbeat to be assigned work again.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub targets: HashMap<String, TargetState>,
    #[serde(default)]
    pub counters: HashMap<String, ThresholdCounter>,
    #[serde(default)]
    pub promotions: Vec<PromotionEvent>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Reads and writes the snapshot file.
///
/// Writes go to a sibling temp file first and land with a rename, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Option<EngineSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "Snapshot persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Task;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let snapshot = EngineSnapshot {
            saved_at: Some(Utc::now()),
            tasks: vec![Task::new("refactor parser".to_string(), 5, 3)],
            ..Default::default()
        };
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].description, "refactor parser");
        assert_eq!(loaded.tasks[0].priority, 5);
    }
}
