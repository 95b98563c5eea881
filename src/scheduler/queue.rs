use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scheduler::task::{Task, TaskStatus};

const DEFAULT_MAX_TASKS: usize = 10_000;

/// Owns every task record and enforces the status lifecycle.
///
/// Ordering is decided at claim time, not insert time: `claimable_ids`
/// sorts by priority descending, then creation time ascending, so equal
/// priorities drain FIFO.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    max_tasks: usize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TASKS)
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            max_tasks,
        }
    }

    /// Add a new task. Returns false if the queue is at capacity.
    pub fn submit(&mut self, task: Task) -> bool {
        if self.tasks.len() >= self.max_tasks {
            return false;
        }
        tracing::info!(task_id = %task.id, priority = task.priority, "Task submitted");
        self.tasks.insert(task.id, task);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Ids of tasks claimable at `now`, best-first.
    pub fn claimable_ids(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut claimable: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .collect();
        claimable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        claimable.into_iter().map(|t| t.id).collect()
    }

    /// All tasks sorted chronologically by creation time.
    pub fn all(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Tasks currently held by a session (assigned or in progress).
    pub fn tasks_for_session(&self, session: &str) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| {
                t.assigned_session.as_deref() == Some(session)
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
            })
            .collect()
    }

    /// Counts per status for the status API.
    pub fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Remove completed and dead-letter tasks. Returns the number removed.
    /// Only terminal tasks are ever destroyed.
    pub fn archive_finished(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.status.is_terminal());
        before - self.tasks.len()
    }

    /// Replace the task set wholesale, used when loading a snapshot.
    pub fn restore(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.max_tasks
    }
}
