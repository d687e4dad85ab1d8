//! Automation API (§4.J) — the HTTP control plane (§6.1).
//!
//! Generalizes the teacher's `factory/api.rs` route handlers (thin
//! extractors over a shared `AppState`, validation up front, `ApiError`
//! mapped to the `{error:{code,message,details?}}` envelope) to the five
//! DevTeam Runner endpoints: generic event ingestion, `initialize`, `status`,
//! and the `pause`/`resume`/`stop` transitions.

use crate::app::AppState;
use crate::errors::ApiError;
use crate::events::CreateExecutionOutcome;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use devteam_common::{Event, ExecutionStatus};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use tracing::instrument;

const MAX_DATA_BYTES: usize = 1024 * 1024;
const DANGEROUS_CHARS: &[char] = &['<', '>', '"', '\'', '&', ';', '|', '`'];

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").unwrap());
static PROJECT_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^/]+/[^/]+$").unwrap());
static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*$").unwrap());

/// The Automation API's own routes, unattached to state — the caller
/// merges this with the WebSocket route and calls `.with_state(...)` once
/// (mirrors the teacher's `api::api_router()`).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/api/devteam/automation/initialize", post(initialize))
        .route("/api/devteam/automation/status/{project_id}", get(status))
        .route("/api/devteam/automation/pause/{project_id}", post(pause))
        .route("/api/devteam/automation/resume/{project_id}", post(resume))
        .route("/api/devteam/automation/stop/{project_id}", post(stop))
}

/// `EventRequest` (§6.1): generic control-plane event envelope.
#[derive(Debug, Deserialize)]
struct EventRequest {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    project_id: Option<String>,
    task: Option<TaskPayload>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    options: EventOptions,
    #[serde(default)]
    metadata: EventMetadata,
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    id: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EventOptions {
    idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EventMetadata {
    correlation_id: Option<String>,
}

fn reject_dangerous(label: &str, value: &str) -> Result<(), ApiError> {
    if value.contains(DANGEROUS_CHARS) {
        return Err(ApiError::Validation(format!("{label} contains a disallowed character")));
    }
    Ok(())
}

fn reject_dangerous_in_value(label: &str, value: &Value) -> Result<(), ApiError> {
    match value {
        Value::String(s) => reject_dangerous(label, s),
        Value::Array(items) => {
            for item in items {
                reject_dangerous_in_value(label, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, v) in map {
                reject_dangerous(label, key)?;
                reject_dangerous_in_value(label, v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validates an `EventRequest` per §6.1's field rules, returning the
/// `(project_id, task_id)` the caller needs to build the `Event` and reply.
fn validate_event_request(req: &EventRequest) -> Result<(Option<String>, Option<String>), ApiError> {
    if !ID_RE.is_match(&req.id) {
        return Err(ApiError::Validation("id must be 1-100 chars matching [A-Za-z0-9_-]+".into()));
    }
    reject_dangerous("id", &req.id)?;

    let (project_id, task_id) = if req.event_type == "DEVTEAM_AUTOMATION" {
        let project_id = req
            .project_id
            .as_deref()
            .ok_or_else(|| ApiError::Validation("project_id is required for DEVTEAM_AUTOMATION".into()))?;
        if !PROJECT_ID_RE.is_match(project_id) {
            return Err(ApiError::Validation("project_id must match ^[^/]+/[^/]+$".into()));
        }
        reject_dangerous("project_id", project_id)?;

        let task = req
            .task
            .as_ref()
            .ok_or_else(|| ApiError::Validation("task is required for DEVTEAM_AUTOMATION".into()))?;
        if !TASK_ID_RE.is_match(&task.id) {
            return Err(ApiError::Validation(r"task.id must match ^\d+(\.\d+)*$".into()));
        }
        reject_dangerous("task.id", &task.id)?;
        let title = task
            .title
            .as_deref()
            .ok_or_else(|| ApiError::Validation("task.title is required for DEVTEAM_AUTOMATION".into()))?;
        reject_dangerous("task.title", title)?;

        (Some(project_id.to_string()), Some(task.id.clone()))
    } else {
        (req.project_id.clone(), req.task.as_ref().map(|t| t.id.clone()))
    };

    if let Some(priority) = &req.priority {
        reject_dangerous("priority", priority)?;
    }
    if let Some(correlation_id) = &req.metadata.correlation_id {
        reject_dangerous("metadata.correlation_id", correlation_id)?;
    }
    if let Some(data) = &req.data {
        if data.to_string().len() > MAX_DATA_BYTES {
            return Err(ApiError::Validation("data exceeds 1 MiB".into()));
        }
        reject_dangerous_in_value("data", data)?;
    }

    Ok((project_id, task_id))
}

/// `POST /events` (§6.1): the generic event-ingestion entry point. Appends
/// (or replays) the event, then — for `DEVTEAM_AUTOMATION` events naming a
/// project with no execution yet running — creates the execution and
/// enqueues it for the worker, the same way `initialize` does.
#[instrument(skip(app, headers, req))]
async fn ingest_event(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EventRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (project_id, task_id) = validate_event_request(&req)?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.options.idempotency_key.clone());

    let payload = json!({
        "id": req.id,
        "task": req.task.as_ref().map(|t| json!({"id": t.id, "title": t.title})),
        "priority": req.priority,
        "data": req.data,
    });

    let mut event = Event::new(req.event_type.clone(), project_id.clone().unwrap_or_default(), payload);
    if let Some(key) = idempotency_key {
        event = event.with_idempotency_key(key);
    }
    if let Some(correlation_id) = req.metadata.correlation_id.clone() {
        event = event.with_correlation_id(correlation_id);
    }

    let outcome = app.events.append(event)?;
    let stored_event = outcome.event().clone();

    if !outcome.was_replayed() && req.event_type == "DEVTEAM_AUTOMATION" {
        if let Some(project_id) = &project_id {
            match app.events.create_execution_if_not_live(project_id, stored_event.id)? {
                CreateExecutionOutcome::Created(execution) => {
                    app.queue
                        .enqueue(execution.execution_id, stored_event.clone())
                        .await
                        .map_err(ApiError::Internal)?;
                }
                CreateExecutionOutcome::AlreadyLive(_) => {}
            }
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": stored_event.id,
            "task_id": task_id,
            "status": "accepted",
            "event_type": stored_event.event_type,
        })),
    ))
}

/// `POST /api/devteam/automation/initialize` (§4.J, §6.1).
#[derive(Debug, Deserialize)]
struct InitializeRequest {
    #[serde(rename = "projectId", alias = "project_id")]
    project_id: String,
    #[serde(rename = "repoUrl", alias = "repo_url")]
    repo_url: String,
    #[serde(rename = "correlationId", alias = "correlation_id", default)]
    correlation_id: Option<String>,
}

#[instrument(skip(app, headers, req))]
async fn initialize(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InitializeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.project_id.trim().is_empty() || req.repo_url.trim().is_empty() {
        return Err(ApiError::Validation("projectId and repoUrl are required".into()));
    }
    reject_dangerous("projectId", &req.project_id)?;
    reject_dangerous("repoUrl", &req.repo_url)?;

    let idempotency_key = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()).map(str::to_string);

    let mut event = Event::new(
        "DEVTEAM_AUTOMATION_INITIALIZE",
        req.project_id.clone(),
        json!({"repoUrl": req.repo_url}),
    );
    if let Some(key) = idempotency_key {
        event = event.with_idempotency_key(key);
    }
    if let Some(correlation_id) = req.correlation_id.clone() {
        event = event.with_correlation_id(correlation_id);
    }

    let outcome = app.events.append(event)?;
    let stored_event = outcome.event().clone();

    if outcome.was_replayed() {
        let execution = app
            .events
            .execution_for_event(stored_event.id)?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("replayed event has no execution on record")))?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({"executionId": execution.execution_id, "eventId": stored_event.id})),
        ));
    }

    match app.events.create_execution_if_not_live(&req.project_id, stored_event.id)? {
        CreateExecutionOutcome::Created(execution) => {
            app.clear_control(&req.project_id);
            app.queue.enqueue(execution.execution_id, stored_event.clone()).await.map_err(ApiError::Internal)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({"executionId": execution.execution_id, "eventId": stored_event.id})),
            ))
        }
        CreateExecutionOutcome::AlreadyLive(_) => {
            Err(ApiError::Conflict(format!("project {} already has a live execution", req.project_id)))
        }
    }
}

/// `GET /api/devteam/automation/status/{projectId}` (§4.I, §6.1).
#[instrument(skip(app))]
async fn status(State(app): State<Arc<AppState>>, Path(project_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let execution = app
        .events
        .live_execution_for_project(&project_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no live execution for project {project_id}")))?;

    let ctx = app.events.load_context(execution.execution_id)?.unwrap_or_default();
    let tasks = load_tasklist_for_status(&app, &project_id, &ctx);
    let projection = crate::projection::project(&execution, &ctx, &tasks);
    Ok(Json(serde_json::to_value(projection).map_err(|e| ApiError::Internal(e.into()))?))
}

/// `status` reads the task list from the checked-out repo when one has been
/// recorded; an execution still in PREP has no `repoPath` yet, so an empty
/// list (zero totals) is the correct read rather than an error.
fn load_tasklist_for_status(_app: &AppState, _project_id: &str, ctx: &devteam_common::TaskContext) -> crate::tasklist::TaskList {
    match &ctx.metadata.repo_path {
        Some(repo_path) => {
            let path = std::path::Path::new(repo_path).join("task_lists.md");
            match std::fs::read_to_string(&path) {
                Ok(markdown) => crate::tasklist::parse(&markdown),
                Err(_) => crate::tasklist::parse(""),
            }
        }
        None => crate::tasklist::parse(""),
    }
}

async fn pause(State(app): State<Arc<AppState>>, Path(project_id): Path<String>) -> Result<Json<Value>, ApiError> {
    transition(&app, &project_id, "pause")
}

async fn resume(State(app): State<Arc<AppState>>, Path(project_id): Path<String>) -> Result<Json<Value>, ApiError> {
    transition(&app, &project_id, "resume")
}

async fn stop(State(app): State<Arc<AppState>>, Path(project_id): Path<String>) -> Result<Json<Value>, ApiError> {
    transition(&app, &project_id, "stop")
}

/// `pause`/`resume`/`stop` (§4.J): transitions rejected with 409 on illegal
/// source states. There is no execution-status row for "paused"/"stopped"
/// mid-flight beyond what the worker itself writes, so legality is judged
/// against the live `Execution.status` plus the project's `ExecutionControl`.
fn transition(app: &AppState, project_id: &str, command: &'static str) -> Result<Json<Value>, ApiError> {
    let execution = app
        .events
        .live_execution_for_project(project_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no live execution for project {project_id}")))?;

    let control = app
        .existing_control(project_id)
        .ok_or_else(|| ApiError::Conflict(format!("project {project_id} has no running worker to control")))?;

    match command {
        "pause" => {
            if execution.status != ExecutionStatus::Running || control.is_stopped() {
                return Err(ApiError::Conflict(format!("cannot pause from state '{}'", execution.status)));
            }
            control.pause();
            app.events.update_execution_status(execution.execution_id, ExecutionStatus::Paused)?;
            Ok(Json(json!({"status": "paused"})))
        }
        "resume" => {
            if execution.status != ExecutionStatus::Paused {
                return Err(ApiError::Conflict(format!("cannot resume from state '{}'", execution.status)));
            }
            control.resume();
            app.events.update_execution_status(execution.execution_id, ExecutionStatus::Running)?;
            Ok(Json(json!({"status": "running"})))
        }
        "stop" => {
            if execution.status.is_terminal() {
                return Err(ApiError::Conflict(format!("cannot stop from state '{}'", execution.status)));
            }
            control.stop();
            app.events.update_execution_status(execution.execution_id, ExecutionStatus::Stopped)?;
            Ok(Json(json!({"status": "stopped"})))
        }
        _ => unreachable!("transition called with an unknown command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_event_request() -> EventRequest {
        EventRequest {
            id: "evt-1".into(),
            event_type: "PLACEHOLDER".into(),
            project_id: None,
            task: None,
            priority: None,
            data: None,
            options: EventOptions::default(),
            metadata: EventMetadata::default(),
        }
    }

    #[test]
    fn validate_rejects_malformed_id() {
        let mut req = minimal_event_request();
        req.id = "bad id with spaces".into();
        assert!(validate_event_request(&req).is_err());
    }

    #[test]
    fn validate_requires_project_id_and_task_for_devteam_automation() {
        let mut req = minimal_event_request();
        req.event_type = "DEVTEAM_AUTOMATION".into();
        assert!(validate_event_request(&req).is_err());

        req.project_id = Some("acme/app".into());
        assert!(validate_event_request(&req).is_err());

        req.task = Some(TaskPayload { id: "1.1.1".into(), title: Some("Do a thing".into()) });
        assert!(validate_event_request(&req).is_ok());
    }

    #[test]
    fn validate_rejects_malformed_project_id() {
        let mut req = minimal_event_request();
        req.event_type = "DEVTEAM_AUTOMATION".into();
        req.project_id = Some("no-slash".into());
        req.task = Some(TaskPayload { id: "1.1.1".into(), title: Some("x".into()) });
        assert!(validate_event_request(&req).is_err());
    }

    #[test]
    fn validate_rejects_malformed_task_id() {
        let mut req = minimal_event_request();
        req.event_type = "DEVTEAM_AUTOMATION".into();
        req.project_id = Some("acme/app".into());
        req.task = Some(TaskPayload { id: "not-numeric".into(), title: Some("x".into()) });
        assert!(validate_event_request(&req).is_err());
    }

    #[test]
    fn validate_rejects_dangerous_characters_in_task_title() {
        let mut req = minimal_event_request();
        req.event_type = "DEVTEAM_AUTOMATION".into();
        req.project_id = Some("acme/app".into());
        req.task = Some(TaskPayload { id: "1.1.1".into(), title: Some("<script>".into()) });
        assert!(validate_event_request(&req).is_err());
    }

    #[test]
    fn validate_rejects_oversize_data() {
        let mut req = minimal_event_request();
        req.data = Some(Value::String("x".repeat(MAX_DATA_BYTES + 1)));
        assert!(validate_event_request(&req).is_err());
    }

    #[test]
    fn validate_accepts_placeholder_event_without_project_or_task() {
        let req = minimal_event_request();
        assert!(validate_event_request(&req).is_ok());
    }

    // Route-level tests, grounded on the teacher's `factory/api.rs` tests
    // (`tower::ServiceExt::oneshot` against the real router + an in-memory
    // store rather than calling handlers directly).
    mod routes {
        use super::*;
        use crate::app::AppState;
        use crate::config::RunnerConfig;
        use crate::events::EventStore;
        use crate::queue::JobQueue;
        use crate::repo::RepoCacheManager;
        use axum::body::Body;
        use axum::http::Request;
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        fn test_app() -> Arc<AppState> {
            let events = EventStore::open_in_memory(6).unwrap();
            let (queue, _receiver) = JobQueue::new(16);
            let cache_dir = tempfile::tempdir().unwrap();
            let repo = RepoCacheManager::new(cache_dir.path());
            Arc::new(AppState::new(RunnerConfig::default(), events, queue, repo, None))
        }

        fn router(app: Arc<AppState>) -> Router {
            super::super::router().with_state(app)
        }

        async fn json_body(response: axum::response::Response) -> Value {
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            serde_json::from_slice(&bytes).unwrap()
        }

        fn post_json(path: &str, body: Value) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        }

        #[tokio::test]
        async fn initialize_then_status_reports_queued_execution() {
            let app = test_app();
            let router = router(app.clone());

            let init_req = post_json(
                "/api/devteam/automation/initialize",
                json!({"projectId": "acme/app", "repoUrl": "https://example.invalid/acme/app.git"}),
            );
            let response = router.clone().oneshot(init_req).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = json_body(response).await;
            assert!(body.get("executionId").is_some());
            assert!(body.get("eventId").is_some());

            let status_req = Request::builder()
                .uri("/api/devteam/automation/status/acme%2Fapp")
                .body(Body::empty())
                .unwrap();
            let response = router.oneshot(status_req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let projection = json_body(response).await;
            assert_eq!(projection["projectId"], "acme/app");
            assert_eq!(projection["totals"]["completed"], 0);
        }

        #[tokio::test]
        async fn initialize_rejects_a_second_call_while_live() {
            let app = test_app();
            let router = router(app);

            let body = json!({"projectId": "acme/app", "repoUrl": "https://example.invalid/acme/app.git"});
            let first = router.clone().oneshot(post_json("/api/devteam/automation/initialize", body.clone())).await.unwrap();
            assert_eq!(first.status(), StatusCode::ACCEPTED);

            let second = router.oneshot(post_json("/api/devteam/automation/initialize", body)).await.unwrap();
            assert_eq!(second.status(), StatusCode::CONFLICT);
        }

        #[tokio::test]
        async fn initialize_with_the_same_idempotency_key_replays_the_same_execution() {
            let app = test_app();
            let router = router(app);
            let body = json!({"projectId": "acme/app", "repoUrl": "https://example.invalid/acme/app.git"});

            let req1 = Request::builder()
                .method("POST")
                .uri("/api/devteam/automation/initialize")
                .header("content-type", "application/json")
                .header("Idempotency-Key", "k1")
                .body(Body::from(body.to_string()))
                .unwrap();
            let response1 = router.clone().oneshot(req1).await.unwrap();
            assert_eq!(response1.status(), StatusCode::ACCEPTED);
            let body1 = json_body(response1).await;

            let req2 = Request::builder()
                .method("POST")
                .uri("/api/devteam/automation/initialize")
                .header("content-type", "application/json")
                .header("Idempotency-Key", "k1")
                .body(Body::from(body.to_string()))
                .unwrap();
            let response2 = router.oneshot(req2).await.unwrap();
            assert_eq!(response2.status(), StatusCode::ACCEPTED);
            let body2 = json_body(response2).await;

            assert_eq!(body1["executionId"], body2["executionId"]);
            assert_eq!(body1["eventId"], body2["eventId"]);
        }

        #[tokio::test]
        async fn pause_before_a_worker_claims_the_project_is_a_conflict() {
            let app = test_app();
            let router = router(app);

            let init = router
                .clone()
                .oneshot(post_json(
                    "/api/devteam/automation/initialize",
                    json!({"projectId": "acme/app", "repoUrl": "https://example.invalid/acme/app.git"}),
                ))
                .await
                .unwrap();
            assert_eq!(init.status(), StatusCode::ACCEPTED);

            let pause_req = Request::builder()
                .method("POST")
                .uri("/api/devteam/automation/pause/acme%2Fapp")
                .body(Body::empty())
                .unwrap();
            let response = router.oneshot(pause_req).await.unwrap();
            assert_eq!(response.status(), StatusCode::CONFLICT);
        }

        #[tokio::test]
        async fn pause_resume_stop_transition_once_a_worker_has_claimed_the_project() {
            let app = test_app();
            let router = router(app.clone());

            router
                .clone()
                .oneshot(post_json(
                    "/api/devteam/automation/initialize",
                    json!({"projectId": "acme/app", "repoUrl": "https://example.invalid/acme/app.git"}),
                ))
                .await
                .unwrap();

            // Simulates the worker claiming the delivery (`worker::process_delivery`
            // calls `control_for` before running the state machine).
            let control = app.control_for("acme/app");
            assert!(!control.is_paused());

            let pause = router
                .clone()
                .oneshot(Request::builder().method("POST").uri("/api/devteam/automation/pause/acme%2Fapp").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(pause.status(), StatusCode::OK);
            assert!(control.is_paused());

            let resume = router
                .clone()
                .oneshot(Request::builder().method("POST").uri("/api/devteam/automation/resume/acme%2Fapp").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resume.status(), StatusCode::OK);
            assert!(!control.is_paused());

            let stop = router
                .oneshot(Request::builder().method("POST").uri("/api/devteam/automation/stop/acme%2Fapp").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(stop.status(), StatusCode::OK);
            assert!(control.is_stopped());
        }

        #[tokio::test]
        async fn status_for_an_unknown_project_is_404() {
            let app = test_app();
            let router = router(app);
            let response = router
                .oneshot(Request::builder().uri("/api/devteam/automation/status/nobody%2Fnothing").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn events_endpoint_accepts_a_placeholder_event() {
            let app = test_app();
            let router = router(app);
            let response = router
                .oneshot(post_json("/events", json!({"id": "evt-1", "type": "PLACEHOLDER"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = json_body(response).await;
            assert_eq!(body["status"], "accepted");
        }
    }
}
