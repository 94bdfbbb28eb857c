//! JSON API over the dispatcher.
//!
//! The server runs on its own thread with a single-threaded tokio runtime.
//! Handlers only forward requests to the dispatcher and await its answer.

use std::thread;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use console::style;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::batch::{BatchRequest, BatchSummary};
use crate::config::{PipelineConfig, parse};
use crate::dispatcher::DispatcherHandle;
use crate::error::{DashError, StoreError, WorkflowError};
use crate::jobs::{JobKind, JobRecord};
use crate::store::{DatasetInfo, StoreAddress};
use crate::workflow::{ConflictChoice, RunMode, SessionStatus};
use crate::workspace::{LocalCopy, LocalFile};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
    /// Store used by batch runs that don't name one.
    pub store: StoreAddress,
}

impl IntoResponse for DashError {
    fn into_response(self) -> Response {
        let status = match &self {
            DashError::UnknownSession(_) | DashError::UnknownJob(_) => StatusCode::NOT_FOUND,
            DashError::Query(..) | DashError::Parse(_) => StatusCode::BAD_REQUEST,
            DashError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            DashError::Store(_) => StatusCode::BAD_GATEWAY,
            DashError::Workflow(err) => match err {
                WorkflowError::InvalidTransition { .. }
                | WorkflowError::ModeRequired
                | WorkflowError::Busy => StatusCode::CONFLICT,
                WorkflowError::NoLocalCopy(_) | WorkflowError::Store(StoreError::NotFound(_)) => {
                    StatusCode::NOT_FOUND
                }
                WorkflowError::Store(_) => StatusCode::BAD_GATEWAY,
                WorkflowError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                WorkflowError::Parse(_)
                | WorkflowError::Graph(_)
                | WorkflowError::UnknownTask(_)
                | WorkflowError::NoTaskSelected => StatusCode::BAD_REQUEST,
            },
            DashError::Settings(_) | DashError::Pool(_) | DashError::Disconnected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!("{self}");
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, DashError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/datasets", get(list_datasets))
        .route("/api/datasets/{id}", get(dataset_info))
        .route("/api/sessions", post(open_session))
        .route("/api/sessions/{id}", get(session_status).delete(close_session))
        .route("/api/sessions/{id}/config", put(edit_config))
        .route("/api/sessions/{id}/graph.svg", get(graph_svg))
        .route("/api/sessions/{id}/mode", post(choose_mode))
        .route("/api/sessions/{id}/task", post(select_task))
        .route("/api/sessions/{id}/run", post(run))
        .route("/api/sessions/{id}/cancel", post(cancel))
        .route("/api/sessions/{id}/local", get(inspect_local).delete(remove_local))
        .route("/api/sessions/{id}/local/files", get(explore_local))
        .route("/api/sessions/{id}/local/clean", post(clean_local))
        .route("/api/sessions/{id}/local/upload", post(upload_local))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(job))
        .route("/api/batch", post(batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API from a dedicated thread.
pub fn start(bind: String, state: AppState) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    let url = style(format!("http://{bind}/api/datasets")).yellow();
    tracing::info!(%url, "starting the API server");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(&bind, state))
    })
}

pub async fn serve(bind: &str, state: AppState) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn list_datasets(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    Ok(Json(state.dispatcher.list_datasets().await?))
}

async fn dataset_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DatasetInfo> {
    Ok(Json(state.dispatcher.dataset_info(id).await?))
}

#[derive(Deserialize)]
struct OpenSession {
    dataset_id: String,
}

async fn open_session(
    State(state): State<AppState>,
    Json(body): Json<OpenSession>,
) -> Result<(StatusCode, Json<SessionStatus>), DashError> {
    let status = state.dispatcher.open(body.dataset_id).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.dispatcher.status(id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, DashError> {
    state.dispatcher.close(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn edit_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    text: String,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.dispatcher.edit_config(id, text).await?))
}

async fn graph_svg(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DashError> {
    let svg = state.dispatcher.graph_svg(id).await?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg))
}

#[derive(Deserialize)]
struct ChooseMode {
    choice: ConflictChoice,
}

async fn choose_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChooseMode>,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.dispatcher.choose_mode(id, body.choice).await?))
}

#[derive(Deserialize)]
struct SelectTask {
    task: String,
}

async fn select_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SelectTask>,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.dispatcher.select_task(id, body.task).await?))
}

async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SessionStatus>), DashError> {
    let status = state.dispatcher.run(id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionStatus> {
    Ok(Json(state.dispatcher.cancel(id).await?))
}

async fn inspect_local(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<LocalCopy> {
    Ok(Json(state.dispatcher.inspect_local(id).await?))
}

async fn explore_local(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<LocalFile>> {
    Ok(Json(state.dispatcher.explore_local(id).await?))
}

async fn remove_local(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let removed = state.dispatcher.remove_local(id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn clean_local(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobRecord>), DashError> {
    let record = state.dispatcher.local_job(id, JobKind::Clean).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn upload_local(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobRecord>), DashError> {
    let record = state.dispatcher.local_job(id, JobKind::Upload).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Vec<JobRecord>> {
    Ok(Json(state.dispatcher.jobs().await?))
}

async fn job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobRecord> {
    Ok(Json(state.dispatcher.job(id).await?))
}

#[derive(Deserialize)]
struct Batch {
    pattern: String,
    task: String,
    mode: RunMode,
    /// Configuration text, the default template when missing.
    config: Option<String>,
    store: Option<StoreAddress>,
}

async fn batch(
    State(state): State<AppState>,
    Json(body): Json<Batch>,
) -> ApiResult<BatchSummary> {
    let config = match body.config {
        Some(text) => parse(&text)?,
        None => PipelineConfig::default_template(),
    };

    let request = BatchRequest {
        pattern: body.pattern,
        task: body.task,
        config,
        mode: body.mode,
        store: body.store.unwrap_or(state.store),
    };

    Ok(Json(state.dispatcher.batch(request).await?))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use camino::Utf8PathBuf;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatcher::{Dashboard, spawn};
    use crate::jobs::{JobQueue, fixed_store};
    use crate::runner::CommandRunner;
    use crate::store::{DataStore, MemoryStore};
    use crate::workspace::WorkAreas;

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let store: Arc<dyn DataStore> = Arc::new(
            MemoryStore::new()
                .with_dataset("fresh", [("images/0.jpg", b"0".as_slice())])
                .with_dataset(
                    "done",
                    [("pipeline.toml", b"[A]\n[B]\ninput = \"A\"\n".as_slice())],
                ),
        );
        let queue = JobQueue::new(
            1,
            areas.clone(),
            Arc::new(CommandRunner::default()),
            fixed_store(store.clone()),
            BTreeMap::new(),
        )
        .unwrap();
        let dashboard =
            Dashboard::new(store, StoreAddress::default(), queue, areas, BTreeMap::new());
        let (dispatcher, _thread) = spawn(dashboard).unwrap();

        let state = AppState {
            dispatcher,
            store: StoreAddress::default(),
        };
        (dir, router(state))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn open(app: &Router, dataset_id: &str) -> (StatusCode, serde_json::Value) {
        let body = serde_json::json!({ "dataset_id": dataset_id });
        send(app, "POST", "/api/sessions", Some(body)).await
    }

    #[tokio::test]
    async fn test_datasets() {
        let (_dir, app) = app();

        let (status, json) = send(&app, "GET", "/api/datasets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!(["done", "fresh"]));

        let (status, json) = send(&app, "GET", "/api/datasets/fresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], "fresh");
        assert_eq!(json["metadata"]["files"], 1);

        let (status, _) = send(&app, "GET", "/api/datasets/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_conflict_flow() {
        let (_dir, app) = app();

        let (status, json) = open(&app, "done").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["state"], "ConflictDetected");
        let id = json["id"].as_str().unwrap().to_string();

        let (status, json) = send(&app, "POST", &format!("/api/sessions/{id}/run"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("choose"));

        let (status, json) = send(
            &app,
            "POST",
            &format!("/api/sessions/{id}/mode"),
            Some(serde_json::json!({ "choice": "new" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "clean");

        let (status, json) = send(
            &app,
            "POST",
            &format!("/api/sessions/{id}/task"),
            Some(serde_json::json!({ "task": "Nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_graph_svg() {
        let (_dir, app) = app();

        let (_, json) = open(&app, "done").await;
        let id = json["id"].as_str().unwrap().to_string();

        let request = Request::get(format!("/api/sessions/{id}/graph.svg"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/svg+xml");
    }

    #[tokio::test]
    async fn test_not_found() {
        let (_dir, app) = app();

        let (status, _) = send(&app, "GET", "/api/sessions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = open(&app, "missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_rejects_bad_pattern() {
        let (_dir, app) = app();

        let (status, _) = send(
            &app,
            "POST",
            "/api/batch",
            Some(serde_json::json!({ "pattern": "(", "task": "Colmap", "mode": "avoid" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_rejects_unrunnable_configuration() {
        let (_dir, app) = app();

        let body = serde_json::json!({
            "pattern": ".*",
            "task": "A",
            "mode": "append",
            "config": "[A]\ninput = \"B\"\n[B]\ninput = \"A\"\n",
        });
        let (status, json) = send(&app, "POST", "/api/batch", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Cyclic"));

        let body = serde_json::json!({ "pattern": ".*", "task": "Nope", "mode": "append" });
        let (status, _) = send(&app, "POST", "/api/batch", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, jobs) = send(&app, "GET", "/api/jobs", None).await;
        assert_eq!(jobs, serde_json::json!([]));
    }
}
