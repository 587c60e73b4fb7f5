//! HTTP trigger and status endpoints for the sync job.

use std::str::FromStr;
use std::sync::Arc;

use arxload_core::{SyncMode, SyncState};
use arxload_sync::{SyncJob, SyncRunSummary};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "arxload-web";

#[derive(Clone)]
pub struct AppState {
    pub job: Arc<SyncJob>,
}

impl AppState {
    pub fn new(job: Arc<SyncJob>) -> Self {
        Self { job }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunQuery {
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<SyncMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobStatus {
    state: SyncState,
    running: bool,
    last_run: Option<SyncRunSummary>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs/arxiv/run", post(run_handler))
        .route("/jobs/arxiv/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "job trigger listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Response {
    let mode = match query.mode.as_deref().map(SyncMode::from_str) {
        None => state.job.default_mode(),
        Some(Ok(mode)) => mode,
        Some(Err(err)) => {
            let body = RunAccepted {
                accepted: false,
                mode: None,
                error: Some(err.to_string()),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    if state.job.spawn_if_idle(mode) {
        info!(%mode, "sync run accepted over http");
        let body = RunAccepted {
            accepted: true,
            mode: Some(mode),
            error: None,
        };
        (StatusCode::ACCEPTED, Json(body)).into_response()
    } else {
        let body = RunAccepted {
            accepted: false,
            mode: Some(mode),
            error: Some("a sync run is already active".to_string()),
        };
        (StatusCode::CONFLICT, Json(body)).into_response()
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(JobStatus {
        state: state.job.current_state(),
        running: state.job.is_running(),
        last_run: state.job.last_summary().await,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arxload_adapters::SourceResolver;
    use arxload_storage::ProgressConfig;
    use arxload_sync::{MemoryConnector, SyncConfig, SyncOrchestrator};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn job(dir: &TempDir) -> Arc<SyncJob> {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.data_dir = dir.path().to_path_buf();
        config.artifact_path = dir.path().join("snapshot.json");
        config.min_free_gb = 0;
        std::fs::write(&config.artifact_path, "{\"id\":\"0704.0001\"}\n").unwrap();
        Arc::new(SyncJob::new(SyncOrchestrator::new(
            config,
            SourceResolver::new(0, ProgressConfig::default()),
            Arc::new(MemoryConnector::default()),
        )))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(AppState::new(job(&dir)))
            .oneshot(get("/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn trigger_is_accepted_and_status_reports_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(job(&dir)));

        let resp = app
            .clone()
            .oneshot(post("/jobs/arxiv/run?mode=acquire"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["accepted"], true);

        let mut status = serde_json::Value::Null;
        for _ in 0..100 {
            let resp = app.clone().oneshot(get("/jobs/arxiv/status")).await.unwrap();
            status = json_body(resp).await;
            if !status["last_run"].is_null() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status["last_run"]["state"], "done");
        assert_eq!(status["last_run"]["mode"], "acquire");
    }

    #[tokio::test]
    async fn trigger_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(&dir);
        let _active = job.flight().try_begin().unwrap();

        let resp = app(AppState::new(Arc::clone(&job)))
            .oneshot(post("/jobs/arxiv/run"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["accepted"], false);
    }

    #[tokio::test]
    async fn unknown_mode_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(AppState::new(job(&dir)))
            .oneshot(post("/jobs/arxiv/run?mode=teleport"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
