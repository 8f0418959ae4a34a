// src/api.rs
//
// =============================================================================
// RAILYARD: MASTER HTTP CONTROL PLANE
// =============================================================================
//
// An axum service over `JobStore`. Every handler runs behind a bearer-token
// auth layer; `StoreError` is translated to an HTTP status exactly once
// (`map_store_error`) instead of each handler hand-rolling its own mapping.

use crate::core::{
    Classification, EnginePreference, FailureReason, HardwareDescriptor, HardwareRequirements,
    Job, JobResult, JobStatus, Priority, Queue,
};
use crate::error::StoreError;
use crate::store::JobStore;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<JobStore>,
    pub auth_token: Arc<String>,
}

pub fn build_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/nodes", post(register_node).get(list_nodes))
        .route("/nodes/:id/heartbeat", post(node_heartbeat))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/next", post(next_job))
        .route("/jobs/:id/result", post(submit_result))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state)
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {err}"))
    }
}

async fn auth_middleware(
    State(state): State<ApiState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected = format!("Bearer {}", state.auth_token);
    let ok = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response();
    }
    next.run(req).await
}

fn map_store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
        StoreError::IllegalTransition { from, to } => (
            StatusCode::CONFLICT,
            format!("illegal transition {from} -> {to}"),
        )
            .into_response(),
        StoreError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
        StoreError::Internal(e) => {
            log::error!("store internal error: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal store error").into_response()
        }
    }
}

// ============================================================================
// HEALTH
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

// ============================================================================
// NODES
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    address: String,
    hardware: HardwareDescriptor,
}

#[derive(Debug, Serialize)]
struct RegisterNodeResponse {
    node_id: Uuid,
}

async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Response {
    match state.store.register_node(&req.address, &req.hardware) {
        Ok((node, created)) => {
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            (status, Json(RegisterNodeResponse { node_id: node.id })).into_response()
        }
        Err(e) => map_store_error(e),
    }
}

async fn list_nodes(State(state): State<ApiState>) -> Response {
    match state.store.list_nodes() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => map_store_error(e),
    }
}

async fn node_heartbeat(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.heartbeat(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_store_error(e),
    }
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    scenario: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    classification: Classification,
    #[serde(default)]
    engine: EnginePreference,
    #[serde(default)]
    queue: Queue,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    requirements: HardwareRequirements,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
}

async fn submit_job(State(state): State<ApiState>, Json(req): Json<SubmitJobRequest>) -> Response {
    let job = Job::new(
        req.scenario,
        req.params,
        req.classification,
        req.engine,
        req.queue,
        req.priority,
        req.requirements,
        req.max_retries,
    );

    if let Err(e) = state.store.create_job(&job) {
        return map_store_error(e);
    }
    if let Err(e) = state.store.enqueue(job.id) {
        return map_store_error(e);
    }
    (StatusCode::CREATED, Json(SubmitJobResponse { job_id: job.id })).into_response()
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    100
}

async fn list_jobs(State(state): State<ApiState>, Query(q): Query<ListJobsQuery>) -> Response {
    let status = match q.status.as_deref() {
        Some(s) => match JobStatus::parse(s) {
            Some(st) => Some(st),
            None => return (StatusCode::BAD_REQUEST, "unknown status filter").into_response(),
        },
        None => None,
    };

    match state.store.list_jobs(status, q.limit) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => map_store_error(e),
    }
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_job(id) {
        Ok(job) => Json(job).into_response(),
        Err(e) => map_store_error(e),
    }
}

async fn cancel_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.update_job_status(id, JobStatus::Canceled, None, None) {
        Ok(job) => Json(job).into_response(),
        Err(e) => map_store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct NextJobRequest {
    node_id: Uuid,
    #[serde(default)]
    free_slots: usize,
}

async fn next_job(State(state): State<ApiState>, Json(req): Json<NextJobRequest>) -> Response {
    match state.store.get_next_job(req.node_id, req.free_slots) {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResultRequest {
    status: String,
    failure_reason: Option<FailureReason>,
    result: Option<JobResult>,
}

async fn submit_result(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitResultRequest>,
) -> Response {
    let Some(status) = JobStatus::parse(&req.status) else {
        return (StatusCode::BAD_REQUEST, "unknown job status").into_response();
    };
    match state
        .store
        .update_job_status(id, status, req.failure_reason, req.result)
    {
        Ok(job) => Json(job).into_response(),
        Err(e) => map_store_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_state() -> (ApiState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("railyard.db")).unwrap();
        (ApiState { store: Arc::new(store), auth_token: Arc::new(TOKEN.to_string()) }, dir)
    }

    fn req(method: &str, path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_requires_no_auth() {
        let (state, _dir) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected() {
        let (state, _dir) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_job_then_fetch_it_round_trips() {
        let (state, _dir) = test_state();
        let app = build_router(state);

        let submit = req(
            "POST",
            "/jobs",
            serde_json::json!({"scenario": "transcode", "params": {"input": "a.mp4"}}),
        );
        let resp = app.clone().oneshot(submit).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let submitted = body_json(resp).await;
        let job_id = submitted["job_id"].as_str().unwrap();

        let get = Request::builder()
            .uri(format!("/jobs/{job_id}"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(get).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = body_json(resp).await;
        assert_eq!(job["id"].as_str().unwrap(), job_id);
        assert_eq!(job["status"], "queued");
    }

    #[tokio::test]
    async fn next_job_respects_engine_eligibility_and_free_slots() {
        let (state, _dir) = test_state();
        let app = build_router(state);

        let submit = req(
            "POST",
            "/jobs",
            serde_json::json!({"scenario": "transcode", "engine": "gstreamer"}),
        );
        app.clone().oneshot(submit).await.unwrap();

        let register = req(
            "POST",
            "/nodes",
            serde_json::json!({
                "address": "10.0.0.1:9000",
                "hardware": {
                    "cpu_threads": 8, "cpu_model": "x", "ram_mb": 4096,
                    "gpu_type": null, "gpu_count": 0, "node_class": "desktop",
                    "tags": [], "engines": ["ffmpeg"]
                }
            }),
        );
        let resp = app.clone().oneshot(register).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let registered = body_json(resp).await;
        let node_id = registered["node_id"].as_str().unwrap();

        // gstreamer falls back to ffmpeg per the eligibility predicate, so
        // a node with only ffmpeg can still claim it.
        let poll = req("POST", "/jobs/next", serde_json::json!({"node_id": node_id, "free_slots": 1}));
        let resp = app.oneshot(poll).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = body_json(resp).await;
        assert_eq!(job["status"], "assigned");
    }

    #[tokio::test]
    async fn cancel_job_is_terminal_and_rejects_further_transitions() {
        let (state, _dir) = test_state();
        let app = build_router(state);

        let submit = req("POST", "/jobs", serde_json::json!({"scenario": "transcode"}));
        let resp = app.clone().oneshot(submit).await.unwrap();
        let submitted = body_json(resp).await;
        let job_id = submitted["job_id"].as_str().unwrap();

        let cancel = Request::builder()
            .method("POST")
            .uri(format!("/jobs/{job_id}/cancel"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(cancel).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let canceled = body_json(resp).await;
        assert_eq!(canceled["status"], "canceled");

        let result = req(
            "POST",
            &format!("/jobs/{job_id}/result"),
            serde_json::json!({"status": "completed"}),
        );
        let resp = app.oneshot(result).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_a_bad_request() {
        let (state, _dir) = test_state();
        let app = build_router(state);
        let list = Request::builder()
            .uri("/jobs?status=not-a-real-status")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(list).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
