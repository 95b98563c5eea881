use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Busy => write!(f, "busy"),
            SessionStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered worker session.
///
/// `last_heartbeat` is wall-clock monotonic and deliberately not persisted;
/// restored sessions come back offline until they heartbeat again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: SessionStatus,
    pub current_task: Option<Uuid>,
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
}

impl Session {
    pub fn new(name: String, capabilities: BTreeSet<String>) -> Self {
        Self {
            name,
            capabilities,
            status: SessionStatus::Idle,
            current_task: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, grace_ms: u64) -> bool {
        self.last_heartbeat.elapsed().as_millis() < grace_ms as u128
    }

    /// A session can serve a task when it advertises every required capability.
    pub fn can_serve(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Tracks every known session by name.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, reviving it if it was offline. Re-registering an
    /// existing session refreshes its capability set but never clobbers a
    /// busy session's task.
    pub fn register(&mut self, name: &str, capabilities: BTreeSet<String>) {
        match self.sessions.get_mut(name) {
            Some(session) => {
                session.capabilities = capabilities;
                session.update_heartbeat();
                if session.status == SessionStatus::Offline {
                    session.status = SessionStatus::Idle;
                    session.current_task = None;
                    tracing::info!(session = name, "Session back online");
                }
            }
            None => {
                tracing::info!(session = name, "Session registered");
                self.sessions
                    .insert(name.to_string(), Session::new(name.to_string(), capabilities));
            }
        }
    }

    /// Update a session heartbeat, auto-registering unknown names.
    pub fn heartbeat(&mut self, name: &str) {
        match self.sessions.get_mut(name) {
            Some(session) => {
                session.update_heartbeat();
                if session.status == SessionStatus::Offline {
                    session.status = SessionStatus::Idle;
                    session.current_task = None;
                    tracing::info!(session = name, "Session back online");
                }
            }
            None => self.register(name, BTreeSet::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Session> {
        self.sessions.get_mut(name)
    }

    /// Idle, alive sessions able to serve `required`, oldest-heartbeat first
    /// so load spreads across the pool.
    pub fn eligible(&self, required: &BTreeSet<String>, grace_ms: u64) -> Vec<String> {
        let mut eligible: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Idle && s.is_alive(grace_ms) && s.can_serve(required)
            })
            .collect();
        eligible.sort_by_key(|s| s.last_heartbeat);
        eligible.into_iter().map(|s| s.name.clone()).collect()
    }

    pub fn all(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    /// Names of sessions whose heartbeat has lapsed.
    pub fn expired(&self, grace_ms: u64) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Offline && !s.is_alive(grace_ms))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Replace the session set from a snapshot. Everything loads offline;
    /// liveness must be re-proven by heartbeat.
    pub fn restore(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions
            .into_iter()
            .map(|mut s| {
                s.status = SessionStatus::Offline;
                s.current_task = None;
                (s.name.clone(), s)
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
