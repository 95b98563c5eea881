use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    /// Higher runs first; ties break oldest-first
    pub priority: i64,
    pub status: TaskStatus,
    /// Capabilities a session must all have to claim this task
    #[serde(default)]
    pub required_caps: BTreeSet<String>,
    #[serde(default)]
    pub project: Option<String>,
    pub assigned_session: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Backoff gate; the task is invisible to claims before this
    pub not_before: Option<DateTime<Utc>>,
    /// Last time the assigned session reported progress
    pub progress_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(description: String, priority: i64, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            priority,
            status: TaskStatus::Pending,
            required_caps: BTreeSet::new(),
            project: None,
            assigned_session: None,
            attempts: 0,
            max_retries,
            result: None,
            error: None,
            created_at: Utc::now(),
            not_before: None,
            progress_at: None,
            completed_at: None,
        }
    }

    pub fn with_caps(mut self, caps: impl IntoIterator<Item = String>) -> Self {
        self.required_caps = caps.into_iter().collect();
        self
    }

    pub fn with_project(mut self, project: String) -> Self {
        self.project = Some(project);
        self
    }

    /// Whether this task is claimable at `now`: pending and past any backoff gate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }
}
