use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::OverseerError;
use crate::health::RestartGovernor;
use crate::notify::{Notifier, Severity};
use crate::promote::{ThresholdEngine, Trigger};
use crate::scheduler::{Assigner, Task, TaskStatus};

#[derive(Clone)]
pub struct ApiState {
    pub assigner: Arc<RwLock<Assigner>>,
    pub governor: Arc<RwLock<RestartGovernor>>,
    pub promotions: Arc<ThresholdEngine>,
    pub notifier: Arc<Notifier>,
}

#[derive(Serialize)]
struct StatusResponse {
    tasks: HashMap<String, usize>,
    sessions: Vec<SessionResponse>,
    targets: HashMap<String, String>,
}

#[derive(Serialize)]
struct SessionResponse {
    name: String,
    status: String,
    capabilities: Vec<String>,
    current_task: Option<String>,
}

#[derive(Serialize)]
struct TaskResponse {
    id: String,
    description: String,
    priority: i64,
    status: String,
    required_caps: Vec<String>,
    project: Option<String>,
    assigned_session: Option<String>,
    attempts: u32,
    max_retries: u32,
    result: Option<String>,
    error: Option<String>,
}

impl TaskResponse {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            description: task.description.clone(),
            priority: task.priority,
            status: task.status.to_string(),
            required_caps: task.required_caps.iter().cloned().collect(),
            project: task.project.clone(),
            assigned_session: task.assigned_session.clone(),
            attempts: task.attempts,
            max_retries: task.max_retries,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    description: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    required_caps: Vec<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
}

#[derive(Serialize)]
struct SubmitTaskResponse {
    success: bool,
    task_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RegisterSessionRequest {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct ProgressRequest {
    session: String,
}

#[derive(Deserialize)]
struct ResultRequest {
    session: String,
    success: bool,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_status(e: &OverseerError) -> StatusCode {
    match e {
        OverseerError::TaskNotFound(_)
        | OverseerError::SessionNotFound(_)
        | OverseerError::TargetNotFound(_)
        | OverseerError::EdgeNotFound(_) => StatusCode::NOT_FOUND,
        OverseerError::PromotionInFlight(_) => StatusCode::CONFLICT,
        OverseerError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn err_json(e: OverseerError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_status(&e),
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/tasks/:id", get(get_task_handler))
        .route("/api/tasks/:id/progress", post(progress_handler))
        .route("/api/tasks/:id/result", post(result_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions", post(register_session_handler))
        .route("/api/sessions/:name/heartbeat", post(heartbeat_handler))
        .route("/api/sessions/:name/claim", post(claim_handler))
        .route("/api/sessions/:name/release", post(release_handler))
        .route("/api/targets", get(list_targets_handler))
        .route("/api/targets/:name/reset", post(reset_target_handler))
        .route("/api/promotions", get(list_promotions_handler))
        .route("/api/promotions/:edge", post(promote_handler))
        .route("/api/alerts", get(list_alerts_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let assigner = state.assigner.read().await;
    let governor = state.governor.read().await;

    let sessions = assigner
        .registry
        .all()
        .into_iter()
        .map(|s| SessionResponse {
            name: s.name.clone(),
            status: s.status.to_string(),
            capabilities: s.capabilities.iter().cloned().collect(),
            current_task: s.current_task.map(|id| id.to_string()),
        })
        .collect();

    let targets = governor
        .states()
        .iter()
        .map(|(name, t)| (name.clone(), t.health.to_string()))
        .collect();

    Json(StatusResponse {
        tasks: assigner.queue.status_counts(),
        sessions,
        targets,
    })
}

async fn list_tasks_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let assigner = state.assigner.read().await;
    let filter: Option<TaskStatus> = query.status.as_deref().and_then(|s| s.parse().ok());
    let tasks: Vec<TaskResponse> = match filter {
        Some(status) => assigner.queue.by_status(status),
        None => assigner.queue.all(),
    }
    .into_iter()
    .map(TaskResponse::from_task)
    .collect();
    Json(tasks)
}

async fn submit_task_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    let max_retries = payload.max_retries.unwrap_or(3);
    let task = Task::new(payload.description, payload.priority, max_retries)
        .with_caps(payload.required_caps);
    let task = match payload.project {
        Some(project) => task.with_project(project),
        None => task,
    };
    match assigner.submit(task) {
        Ok(id) => (
            StatusCode::OK,
            Json(SubmitTaskResponse {
                success: true,
                task_id: Some(id.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubmitTaskResponse {
                success: false,
                task_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn get_task_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let assigner = state.assigner.read().await;
    match assigner.queue.get(&id) {
        Some(task) => Json(TaskResponse::from_task(task)).into_response(),
        None => err_json(OverseerError::TaskNotFound(id.to_string())).into_response(),
    }
}

async fn progress_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProgressRequest>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    match assigner.report_progress(&id, &payload.session, Utc::now()) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_json(e).into_response(),
    }
}

async fn result_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ResultRequest>,
) -> impl IntoResponse {
    let outcome = {
        let mut assigner = state.assigner.write().await;
        assigner.report_result(&id, &payload.session, payload.success, payload.output, Utc::now())
    };
    match outcome {
        Ok(status) => {
            if status == TaskStatus::DeadLetter {
                state
                    .notifier
                    .notify(
                        Severity::Critical,
                        "scheduler",
                        format!("task {id} exhausted retries and was dead-lettered"),
                    )
                    .await;
            }
            Json(serde_json::json!({ "status": status.to_string() })).into_response()
        }
        Err(e) => err_json(e).into_response(),
    }
}

async fn list_sessions_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let assigner = state.assigner.read().await;
    let sessions: Vec<SessionResponse> = assigner
        .registry
        .all()
        .into_iter()
        .map(|s| SessionResponse {
            name: s.name.clone(),
            status: s.status.to_string(),
            capabilities: s.capabilities.iter().cloned().collect(),
            current_task: s.current_task.map(|id| id.to_string()),
        })
        .collect();
    Json(sessions)
}

async fn register_session_handler(
    State(state): State<ApiState>,
    Json(payload): Json<RegisterSessionRequest>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    let caps: BTreeSet<String> = payload.capabilities.into_iter().collect();
    assigner.registry.register(&payload.name, caps);
    StatusCode::OK
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    assigner.registry.heartbeat(&name);
    StatusCode::OK
}

async fn claim_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    match assigner.claim_for(&name, Utc::now()) {
        Ok(Some(task)) => Json(Some(TaskResponse::from_task(&task))).into_response(),
        Ok(None) => Json(None::<TaskResponse>).into_response(),
        Err(e) => err_json(e).into_response(),
    }
}

async fn release_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut assigner = state.assigner.write().await;
    match assigner.release_session(&name) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_json(e).into_response(),
    }
}

async fn list_targets_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let governor = state.governor.read().await;
    let targets: HashMap<String, String> = governor
        .states()
        .iter()
        .map(|(name, t)| (name.clone(), t.health.to_string()))
        .collect();
    Json(targets)
}

async fn reset_target_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut governor = state.governor.write().await;
    if governor.health_of(&name).is_none() {
        return err_json(OverseerError::TargetNotFound(name)).into_response();
    }
    let was_blocked = governor.reset(&name);
    Json(serde_json::json!({ "reset": true, "was_blocked": was_blocked })).into_response()
}

async fn list_promotions_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let history = state.promotions.history().await;
    let counters = state.promotions.counters().await;
    Json(serde_json::json!({ "counters": counters, "history": history }))
}

async fn promote_handler(
    State(state): State<ApiState>,
    Path(edge): Path<String>,
) -> impl IntoResponse {
    match state.promotions.promote(&edge, Trigger::Manual).await {
        Ok(event) => Json(event).into_response(),
        Err(e) => err_json(e).into_response(),
    }
}

async fn list_alerts_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.notifier.recent().await)
}
