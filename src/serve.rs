use crate::broadcast::Frame;
use crate::config::WatchConfig;
use crate::lifecycle::{LifecycleError, StartOptions};
use crate::registry::{LogContent, LogFileDescriptor, RegistryError};
use crate::signals;
use crate::status::{HealthReport, StatusReport};
use crate::supervisor::Supervisor;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;

type AppState = Arc<Supervisor>;

pub async fn run(config: &WatchConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = Arc::new(Supervisor::new(config)?);
    let hub = supervisor.hub.clone();
    let app = router(supervisor);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        script = %config.agent.script.display(),
        logs = %config.logs.dir.display(),
        "agentwatch listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signals::shutdown_signal().await;
            // Open event streams never end on their own.
            hub.close_all();
        })
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

pub fn router(supervisor: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/logs", get(api_logs))
        .route("/api/logs/latest", get(api_logs_latest))
        .route("/api/logs/{name}", get(api_log_content))
        .route("/api/stream", get(api_stream))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .with_state(supervisor)
        .layer(CorsLayer::permissive())
}

/// JSON error body: `{ "error": ..., "pid": ... }`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    pid: Option<u32>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            pid: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message });
        if let Some(pid) = self.pid {
            body["pid"] = pid.into();
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        let (status, pid) = match &e {
            LifecycleError::NotRunning => (StatusCode::CONFLICT, None),
            LifecycleError::ProcessNotFound { pid } => (StatusCode::NOT_FOUND, Some(*pid)),
            LifecycleError::AlreadyRunning { pid, .. } => (StatusCode::CONFLICT, Some(*pid)),
            LifecycleError::Spawn { .. } | LifecycleError::Signal { .. } => {
                tracing::error!(error = %e, "lifecycle operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        Self {
            status,
            message: e.to_string(),
            pid,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            RegistryError::FileNotFound { .. } => StatusCode::NOT_FOUND,
            _ => {
                tracing::warn!(error = %e, "log read failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

/// Parse an optional JSON body; an empty body means the defaults.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))
}

async fn health(State(sup): State<AppState>) -> Json<HealthReport> {
    Json(sup.health().await)
}

async fn api_status(State(sup): State<AppState>) -> Json<StatusReport> {
    Json(sup.status().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    max_age_secs: Option<u64>,
}

async fn api_logs(
    State(sup): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogFileDescriptor>> {
    let window = query
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| sup.active_window());
    Json(sup.registry.list(window).await)
}

async fn api_logs_latest(State(sup): State<AppState>) -> Json<serde_json::Value> {
    let filename = sup.registry.latest().await.map(|d| d.filename);
    Json(serde_json::json!({ "filename": filename }))
}

async fn api_log_content(
    State(sup): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LogContent>, ApiError> {
    Ok(Json(sup.registry.read_full(&name).await?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    attempt: u32,
}

fn to_sse(frame: Frame) -> Event {
    let name = frame.event.name();
    let event = match Event::default().event(name).json_data(&frame.event) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(event = name, error = %e, "failed to encode event");
            Event::default().event(name).data("{}")
        }
    };
    let event = event.id(frame.id.to_string());
    match frame.retry {
        Some(retry) => event.retry(retry),
        None => event,
    }
}

async fn api_stream(
    State(sup): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = sup.hub.subscribe(query.attempt);
    tracing::info!(
        subscription = subscription.id(),
        attempt = query.attempt,
        "event stream opened"
    );
    Sse::new(subscription.map(|frame| Ok(to_sse(frame))))
}

async fn api_start(
    State(sup): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let options: StartOptions = json_body(&body)?;
    let pid = sup.controller.start(&options).await?;
    Ok(Json(serde_json::json!({ "ok": true, "pid": pid })))
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    pid: Option<u32>,
}

async fn api_stop(
    State(sup): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: StopRequest = json_body(&body)?;
    let pid = sup.controller.stop(request.pid).await?;
    Ok(Json(serde_json::json!({ "ok": true, "pid": pid })))
}
