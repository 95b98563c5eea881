use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{OverseerError, Result};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::registry::{SessionRegistry, SessionStatus};
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::task::{Task, TaskStatus};

/// What one reap pass reclaimed.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub reclaimed: usize,
    /// Tasks the pass dead-lettered, for the caller to alert on.
    pub dead_lettered: Vec<Uuid>,
}

/// Matches pending tasks to idle sessions.
///
/// The assigner owns both the queue and the registry so every claim is a
/// single mutation under one `&mut self`: a task moves Pending -> Assigned
/// and its session Idle -> Busy together, or neither moves. Callers share
/// it behind one `RwLock`, which is what rules out double assignment.
#[derive(Debug)]
pub struct Assigner {
    pub queue: TaskQueue,
    pub registry: SessionRegistry,
    retry: RetryPolicy,
    heartbeat_grace_ms: u64,
    visibility_timeout_secs: u64,
}

impl Assigner {
    pub fn new(retry: RetryConfig, heartbeat_grace_ms: u64, visibility_timeout_secs: u64) -> Self {
        Self {
            queue: TaskQueue::new(),
            registry: SessionRegistry::new(),
            retry: RetryPolicy::new(retry),
            heartbeat_grace_ms,
            visibility_timeout_secs,
        }
    }

    pub fn submit(&mut self, task: Task) -> Result<Uuid> {
        let id = task.id;
        if !self.queue.submit(task) {
            return Err(OverseerError::Internal("task queue is full".into()));
        }
        Ok(id)
    }

    /// Assign the best claimable task to an eligible session.
    /// Returns the pair when an assignment was made.
    pub fn assign_next(&mut self, now: DateTime<Utc>) -> Option<(Uuid, String)> {
        for task_id in self.queue.claimable_ids(now) {
            let required = self.queue.get(&task_id)?.required_caps.clone();
            let candidates = self.registry.eligible(&required, self.heartbeat_grace_ms);
            if let Some(session) = candidates.into_iter().next() {
                self.bind(&task_id, &session);
                return Some((task_id, session));
            }
        }
        None
    }

    /// Claim a task on behalf of a named session (the pull path).
    pub fn claim_for(&mut self, session: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let state = self
            .registry
            .get(session)
            .ok_or_else(|| OverseerError::SessionNotFound(session.to_string()))?;
        if state.status != SessionStatus::Idle {
            return Ok(None);
        }
        let caps = state.capabilities.clone();
        let task_id = self
            .queue
            .claimable_ids(now)
            .into_iter()
            .find(|id| {
                self.queue
                    .get(id)
                    .map(|t| t.required_caps.is_subset(&caps))
                    .unwrap_or(false)
            });
        match task_id {
            Some(id) => {
                self.bind(&id, session);
                Ok(self.queue.get(&id).cloned())
            }
            None => Ok(None),
        }
    }

    /// Both transitions happen here, under the one exclusive borrow.
    fn bind(&mut self, task_id: &Uuid, session: &str) {
        if let Some(task) = self.queue.get_mut(task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_session = Some(session.to_string());
            task.attempts += 1;
        }
        if let Some(state) = self.registry.get_mut(session) {
            state.status = SessionStatus::Busy;
            state.current_task = Some(*task_id);
        }
        tracing::info!(task_id = %task_id, session, "Task assigned");
    }

    /// A session reports it has started (or is still making) progress.
    pub fn report_progress(
        &mut self,
        task_id: &Uuid,
        session: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task = self
            .queue
            .get_mut(task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.to_string()))?;
        if task.assigned_session.as_deref() != Some(session) {
            return Err(OverseerError::Internal(format!(
                "task {task_id} is not held by session {session}"
            )));
        }
        match task.status {
            TaskStatus::Assigned => {
                task.status = TaskStatus::InProgress;
                task.progress_at = Some(now);
                Ok(())
            }
            TaskStatus::InProgress => {
                task.progress_at = Some(now);
                Ok(())
            }
            other => Err(OverseerError::InvalidTransition {
                task: task_id.to_string(),
                from: other.to_string(),
                to: TaskStatus::InProgress.to_string(),
            }),
        }
    }

    /// A session reports the outcome of its current task. Failures retry
    /// with backoff until the retry budget is spent, then dead-letter.
    pub fn report_result(
        &mut self,
        task_id: &Uuid,
        session: &str,
        success: bool,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        let max_retries;
        let attempts;
        {
            let task = self
                .queue
                .get_mut(task_id)
                .ok_or_else(|| OverseerError::TaskNotFound(task_id.to_string()))?;
            if task.assigned_session.as_deref() != Some(session) {
                return Err(OverseerError::Internal(format!(
                    "task {task_id} is not held by session {session}"
                )));
            }
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                return Err(OverseerError::InvalidTransition {
                    task: task_id.to_string(),
                    from: task.status.to_string(),
                    to: if success {
                        TaskStatus::Completed.to_string()
                    } else {
                        TaskStatus::Failed.to_string()
                    },
                });
            }
            max_retries = task.max_retries;
            attempts = task.attempts;
        }

        self.free_session(session);

        let status = if success {
            let task = self.queue.get_mut(task_id).ok_or_else(|| {
                OverseerError::TaskNotFound(task_id.to_string())
            })?;
            task.status = TaskStatus::Completed;
            task.result = output;
            task.assigned_session = None;
            task.completed_at = Some(now);
            tracing::info!(task_id = %task_id, session, "Task completed");
            TaskStatus::Completed
        } else if attempts >= max_retries {
            let task = self.queue.get_mut(task_id).ok_or_else(|| {
                OverseerError::TaskNotFound(task_id.to_string())
            })?;
            task.status = TaskStatus::DeadLetter;
            task.error = output;
            task.assigned_session = None;
            task.completed_at = Some(now);
            tracing::warn!(task_id = %task_id, attempts, "Task dead-lettered");
            TaskStatus::DeadLetter
        } else {
            let delay = self.retry.next_delay(attempts);
            let task = self.queue.get_mut(task_id).ok_or_else(|| {
                OverseerError::TaskNotFound(task_id.to_string())
            })?;
            task.status = TaskStatus::Pending;
            task.error = output;
            task.assigned_session = None;
            task.progress_at = None;
            task.not_before =
                Some(now + ChronoDuration::milliseconds(delay.as_millis() as i64));
            tracing::warn!(
                task_id = %task_id,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Task failed, will retry"
            );
            TaskStatus::Pending
        };
        Ok(status)
    }

    /// Manually return a busy session to idle, requeueing anything it held.
    pub fn release_session(&mut self, session: &str) -> Result<()> {
        if self.registry.get(session).is_none() {
            return Err(OverseerError::SessionNotFound(session.to_string()));
        }
        self.requeue_held(session, false);
        self.free_session(session);
        Ok(())
    }

    /// Reclaim work from dead sessions and stalled tasks.
    ///
    /// Sessions past the heartbeat grace go offline and their tasks return
    /// to pending without burning an attempt. In-progress tasks whose
    /// progress reports stopped are treated as failures of the holding
    /// session and requeued with an attempt spent.
    pub fn reap(&mut self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        for name in self.registry.expired(self.heartbeat_grace_ms) {
            tracing::warn!(session = %name, "Session heartbeat lapsed, marking offline");
            report.reclaimed += self.requeue_held(&name, false);
            if let Some(state) = self.registry.get_mut(&name) {
                state.status = SessionStatus::Offline;
                state.current_task = None;
            }
        }

        // Tasks whose holder is offline or gone, e.g. after a snapshot
        // reload where every session comes back offline.
        let orphaned: Vec<Uuid> = self
            .queue
            .all()
            .into_iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
                    && t.assigned_session.as_deref().map_or(true, |s| {
                        self.registry
                            .get(s)
                            .map_or(true, |state| state.status != SessionStatus::Busy)
                    })
            })
            .map(|t| t.id)
            .collect();
        for task_id in orphaned {
            tracing::warn!(task_id = %task_id, "Task holder is gone, requeueing");
            self.requeue_task(&task_id, false, now);
            report.reclaimed += 1;
        }

        let stalled: Vec<Uuid> = self
            .queue
            .by_status(TaskStatus::InProgress)
            .into_iter()
            .filter(|t| {
                let last = t.progress_at.unwrap_or(t.created_at);
                now - last > ChronoDuration::seconds(self.visibility_timeout_secs as i64)
            })
            .map(|t| t.id)
            .collect();
        for task_id in stalled {
            let holder = self
                .queue
                .get(&task_id)
                .and_then(|t| t.assigned_session.clone());
            tracing::warn!(task_id = %task_id, "Task visibility timeout, reclaiming");
            if let Some(session) = holder {
                self.free_session(&session);
            }
            if self.requeue_task(&task_id, true, now) {
                report.dead_lettered.push(task_id);
            }
            report.reclaimed += 1;
        }

        report
    }

    fn free_session(&mut self, session: &str) {
        if let Some(state) = self.registry.get_mut(session) {
            if state.status == SessionStatus::Busy {
                state.status = SessionStatus::Idle;
            }
            state.current_task = None;
        }
    }

    fn requeue_held(&mut self, session: &str, spend_attempt: bool) -> usize {
        let held: Vec<Uuid> = self
            .queue
            .tasks_for_session(session)
            .into_iter()
            .map(|t| t.id)
            .collect();
        let now = Utc::now();
        for task_id in &held {
            self.requeue_task(task_id, spend_attempt, now);
        }
        held.len()
    }

    /// Returns true when the task was dead-lettered instead of requeued.
    fn requeue_task(&mut self, task_id: &Uuid, spend_attempt: bool, now: DateTime<Utc>) -> bool {
        let delay = if spend_attempt {
            let attempts = self.queue.get(task_id).map(|t| t.attempts).unwrap_or(0);
            Some(self.retry.next_delay(attempts))
        } else {
            None
        };
        if let Some(task) = self.queue.get_mut(task_id) {
            if task.status.is_terminal() {
                return false;
            }
            if spend_attempt && task.attempts >= task.max_retries {
                task.status = TaskStatus::DeadLetter;
                task.assigned_session = None;
                task.completed_at = Some(now);
                tracing::warn!(task_id = %task_id, "Task dead-lettered after reclaim");
                return true;
            }
            if !spend_attempt {
                // The session died, not the task; give the attempt back.
                task.attempts = task.attempts.saturating_sub(1);
            }
            task.status = TaskStatus::Pending;
            task.assigned_session = None;
            task.progress_at = None;
            task.not_before = delay
                .map(|d| now + ChronoDuration::milliseconds(d.as_millis() as i64));
        }
        false
    }
}
