use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverseerError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No idle sessions available")]
    NoSessionsAvailable,

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Unknown target: {0}")]
    TargetNotFound(String),

    #[error("Unknown promotion edge: {0}")]
    EdgeNotFound(String),

    #[error("Promotion already in flight for edge {0}")]
    PromotionInFlight(String),

    #[error("Version control operation failed: {0}")]
    Vcs(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Gate failed: {0}")]
    GateFailed(String),

    #[error("Service did not become healthy: {0}")]
    VerificationFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OverseerError>;
