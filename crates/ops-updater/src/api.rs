//! C9 — update control API. Single long-running `axum` server exposing
//! the authenticated REST surface over C8, narrowed to the auth concern
//! this API needs (no CORS/rate-limiting/compression layers — those
//! belong to the outer product's edge gateway).

use crate::auth::validate_secret;
use crate::executor::UpdateExecutor;
use crate::models::{HistoryEntry, RollbackRequest, SidecarStatus, UpdateRequest, UpdateResultStatus};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

const HISTORY_CAPACITY: usize = 100;

pub struct ApiState {
    executor: Arc<UpdateExecutor>,
    secret: String,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl ApiState {
    pub fn new(executor: Arc<UpdateExecutor>, secret: String) -> Self {
        Self { executor, secret, history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)) }
    }

    fn record_history(&self, entry: HistoryEntry) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/update/apply", post(apply))
        .route("/update/rollback", post(rollback))
        .route("/update/history", get(history))
        .route("/diagnostics", get(diagnostics))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Option<Response> {
    let provided = headers.get("X-Updater-Secret").and_then(|v| v.to_str().ok());
    if validate_secret(&state.secret, provided) {
        None
    } else {
        Some(error_response(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = authorize(&state, &headers) {
        return resp;
    }
    let runtime = state.executor.current_state().await;
    Json(SidecarStatus { state: state.executor.operation_state(), runtime }).into_response()
}

async fn apply(State(state): State<Arc<ApiState>>, headers: HeaderMap, body: Result<Json<UpdateRequest>, axum::extract::rejection::JsonRejection>) -> Response {
    if let Some(resp) = authorize(&state, &headers) {
        return resp;
    }
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if req.tag.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "tag required");
    }
    if req.version.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "version required");
    }

    if state.executor.is_busy() {
        return error_response(StatusCode::CONFLICT, "Update already in progress");
    }

    let result = state.executor.apply_update(&req.tag, &req.version).await;
    state.record_history(HistoryEntry {
        tag: req.tag.clone(),
        version: req.version.clone(),
        result: result.status,
        timestamp: chrono::Utc::now(),
    });

    if result.status != UpdateResultStatus::Success {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response();
    }
    Json(result).into_response()
}

async fn rollback(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Result<Json<RollbackRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Some(resp) = authorize(&state, &headers) {
        return resp;
    }
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if req.previous_sha.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "previous_sha required");
    }

    if state.executor.is_busy() {
        return error_response(StatusCode::CONFLICT, "Update already in progress");
    }

    let result = state.executor.rollback(&req.previous_sha).await;
    state.record_history(HistoryEntry {
        tag: format!("rollback:{}", req.previous_sha),
        version: "rollback".to_string(),
        result: result.status,
        timestamp: chrono::Utc::now(),
    });

    if result.status != UpdateResultStatus::RolledBack {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response();
    }
    Json(result).into_response()
}

async fn history(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = authorize(&state, &headers) {
        return resp;
    }
    let entries: Vec<HistoryEntry> = state.history.lock().iter().cloned().collect();
    Json(json!({ "entries": entries })).into_response()
}

async fn diagnostics(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(state.executor.get_diagnostics().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_executor(dir: &std::path::Path) -> Arc<UpdateExecutor> {
        let mut health_urls = HashMap::new();
        for key in ["skills-blue", "skills-green", "api-blue", "api-green", "routed_skills", "routed_api"] {
            health_urls.insert(key.to_string(), "http://127.0.0.1:1/never".to_string());
        }
        Arc::new(UpdateExecutor::new(ExecutorConfig {
            project_dir: dir.to_path_buf(),
            compose_file: dir.join("compose.yml"),
            route_config_path: dir.join("routes.yaml"),
            runtime_state_path: dir.join("state.json"),
            health_urls,
            pause_on_failure: true,
        }))
    }

    #[tokio::test]
    async fn health_endpoint_always_open() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ApiState::new(test_executor(dir.path()), "s3cr3t".to_string()));
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_requires_matching_secret() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ApiState::new(test_executor(dir.path()), "s3cr3t".to_string()));
        let app = router(state);

        let unauthorized = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let authorized = app
            .oneshot(Request::builder().uri("/status").header("X-Updater-Secret", "s3cr3t").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(authorized.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn apply_rejects_missing_tag_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ApiState::new(test_executor(dir.path()), "".to_string()));
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/update/apply")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tag":"","version":"1.0"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
