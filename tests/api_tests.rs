use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower::ServiceExt;

use overseer::api::{router, ApiState};
use overseer::config::{EdgeConfig, EngineConfig};
use overseer::error::Result;
use overseer::health::RestartGovernor;
use overseer::notify::Notifier;
use overseer::promote::{
    GateRunner, MigrationRunner, PromotionPipeline, ServiceVerifier, ThresholdEngine, Vcs,
};
use overseer::scheduler::Assigner;

// Stub collaborators so promotion endpoints run without git or a shell.

struct StubVcs;

#[async_trait]
impl Vcs for StubVcs {
    async fn source_head(&self, _edge: &EdgeConfig) -> Result<String> {
        Ok("head-1".to_string())
    }
    async fn count_since(&self, _edge: &EdgeConfig, _since: Option<&str>) -> Result<(u64, u64)> {
        Ok((0, 0))
    }
    async fn merge(&self, _edge: &EdgeConfig) -> Result<String> {
        Ok("merge-1".to_string())
    }
    async fn latest_tag(&self, _edge: &EdgeConfig) -> Result<Option<String>> {
        Ok(None)
    }
    async fn tag(&self, _edge: &EdgeConfig, _name: &str) -> Result<()> {
        Ok(())
    }
    async fn revert_to(&self, _edge: &EdgeConfig, _git_ref: &str) -> Result<()> {
        Ok(())
    }
    async fn target_head(&self, _edge: &EdgeConfig) -> Result<String> {
        Ok("target-1".to_string())
    }
}

struct StubGates;

#[async_trait]
impl GateRunner for StubGates {
    async fn run_gates(&self, _edge: &EdgeConfig) -> Result<()> {
        Ok(())
    }
}

struct StubMigrator;

#[async_trait]
impl MigrationRunner for StubMigrator {
    async fn backup(&self, _edge: &EdgeConfig) -> Result<Option<String>> {
        Ok(None)
    }
    async fn apply(&self, _edge: &EdgeConfig) -> Result<()> {
        Ok(())
    }
    async fn restore(&self, _edge: &EdgeConfig, _handle: &str) -> Result<()> {
        Ok(())
    }
}

struct StubVerifier;

#[async_trait]
impl ServiceVerifier for StubVerifier {
    async fn restart_and_verify(&self, _target: &overseer::config::TargetConfig) -> Result<()> {
        Ok(())
    }
}

fn test_app() -> Router {
    let config = EngineConfig::default().with_edge(EdgeConfig {
        name: "dev-qa".to_string(),
        source_branch: "dev".to_string(),
        target_branch: "qa".to_string(),
        repo_path: PathBuf::from("/srv/repo"),
        commit_threshold: 5,
        feature_threshold: 3,
        feature_marker: "feat".to_string(),
        gate_commands: vec![],
        backup_command: None,
        migrate_command: None,
        restore_command: None,
        service: None,
        requires_healthy: None,
        requires_success_of: None,
        tag_prefix: "v".to_string(),
    });

    let mut governor = RestartGovernor::new(config.restart.clone());
    governor.track("payments-api", true);

    let vcs = Arc::new(StubVcs);
    let pipeline = PromotionPipeline::new(
        vcs.clone(),
        Arc::new(StubGates),
        Arc::new(StubMigrator),
        Arc::new(StubVerifier),
    );
    let governor = Arc::new(RwLock::new(governor));
    let notifier = Arc::new(Notifier::new(vec![], 50));
    let promotions = Arc::new(ThresholdEngine::new(
        config.clone(),
        vcs,
        pipeline,
        governor.clone(),
        notifier.clone(),
    ));

    let state = ApiState {
        assigner: Arc::new(RwLock::new(Assigner::new(
            config.retry.clone(),
            config.heartbeat_grace_ms,
            config.visibility_timeout_secs,
        ))),
        governor,
        promotions,
        notifier,
    };
    router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_submit_and_list_tasks() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/tasks",
            json!({ "description": "rebuild search index", "priority": 5 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let response = app.clone().oneshot(get("/api/tasks")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["description"], "rebuild search index");
    assert_eq!(body[0]["priority"], 5);

    let response = app
        .oneshot(get(&format!("/api/tasks/{task_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn test_get_unknown_task_is_404() {
    let app = test_app();
    let response = app
        .oneshot(get(&format!("/api/tasks/{}", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_tasks_filters_by_status() {
    let app = test_app();
    app.clone()
        .oneshot(post_json("/api/tasks", json!({ "description": "a" })))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get("/api/tasks?status=pending"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = app
        .oneshot(get("/api/tasks?status=completed"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_and_complete_over_http() {
    let app = test_app();

    app.clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({ "name": "worker-1", "capabilities": [] }),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json("/api/tasks", json!({ "description": "compact logs" })))
        .await
        .unwrap();
    let task_id = body_json(response).await["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_empty("/api/sessions/worker-1/claim"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], task_id.as_str());
    assert_eq!(body["status"], "assigned");
    assert_eq!(body["assigned_session"], "worker-1");

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/tasks/{task_id}/result"),
            json!({ "session": "worker-1", "success": true, "output": "done" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "completed");

    // Session went back to idle, and a second claim finds nothing.
    let response = app
        .oneshot(post_empty("/api/sessions/worker-1/claim"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body.is_null());
}

#[tokio::test]
async fn test_claim_for_unknown_session_is_404() {
    let app = test_app();
    let response = app
        .oneshot(post_empty("/api/sessions/ghost/claim"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_reports_targets_and_sessions() {
    let app = test_app();
    app.clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({ "name": "worker-1", "capabilities": ["deploy"] }),
        ))
        .await
        .unwrap();

    let response = app.oneshot(get("/api/status")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["targets"]["payments-api"], "healthy");
    assert_eq!(body["sessions"][0]["name"], "worker-1");
    assert_eq!(body["sessions"][0]["status"], "idle");
}

#[tokio::test]
async fn test_reset_target() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_empty("/api/targets/nonexistent/reset"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(post_empty("/api/targets/payments-api/reset"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["reset"], true);
    assert_eq!(body["was_blocked"], false);
}

#[tokio::test]
async fn test_manual_promotion_over_http() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_empty("/api/promotions/dev-qa"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["trigger"], "manual");
    assert_eq!(body["tag"], "v0.1.0");

    let response = app.clone().oneshot(get("/api/promotions")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["history"].as_array().unwrap().len(), 1);

    let response = app
        .oneshot(post_empty("/api/promotions/unknown-edge"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_alerts_endpoint_starts_empty() {
    let app = test_app();
    let response = app.oneshot(get("/api/alerts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.as_array().unwrap().is_empty());
}
