use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accumulated pressure on one promotion edge.
///
/// Counts are always re-derived from version control relative to
/// `baseline`, never incremented in place, so evaluating an edge twice
/// in a row gives the same answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdCounter {
    /// Ref the last promotion landed; counting starts after it
    pub baseline: Option<String>,
    pub commits: u64,
    pub features: u64,
    pub last_evaluated: Option<DateTime<Utc>>,
}

impl ThresholdCounter {
    pub fn observe(&mut self, commits: u64, features: u64, now: DateTime<Utc>) {
        self.commits = commits;
        self.features = features;
        self.last_evaluated = Some(now);
    }

    pub fn advance(&mut self, new_baseline: String) {
        self.baseline = Some(new_baseline);
        self.commits = 0;
        self.features = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Commits,
    Features,
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Commits => write!(f, "commits"),
            Trigger::Features => write!(f, "features"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
}

impl std::fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionStatus::InProgress => write!(f, "in_progress"),
            PromotionStatus::Succeeded => write!(f, "succeeded"),
            PromotionStatus::Failed => write!(f, "failed"),
            PromotionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Gates,
    Merge,
    Tag,
    Backup,
    Migrate,
    Restart,
    Verify,
    Rollback,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Gates => write!(f, "gates"),
            Stage::Merge => write!(f, "merge"),
            Stage::Tag => write!(f, "tag"),
            Stage::Backup => write!(f, "backup"),
            Stage::Migrate => write!(f, "migrate"),
            Stage::Restart => write!(f, "restart"),
            Stage::Verify => write!(f, "verify"),
            Stage::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub passed: bool,
    pub detail: Option<String>,
}

/// One promotion attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionEvent {
    pub id: Uuid,
    pub edge: String,
    pub trigger: Trigger,
    pub status: PromotionStatus,
    pub stages: Vec<StageRecord>,
    pub tag: Option<String>,
    pub merged_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PromotionEvent {
    pub fn begin(edge: &str, trigger: Trigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            edge: edge.to_string(),
            trigger,
            status: PromotionStatus::InProgress,
            stages: Vec::new(),
            tag: None,
            merged_ref: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn record(&mut self, stage: Stage, passed: bool, detail: Option<String>) {
        self.stages.push(StageRecord {
            stage,
            passed,
            detail,
        });
    }

    pub fn finish(&mut self, status: PromotionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
    }
}
