//! Admin surface
//!
//! JSON-over-HTTP control verbs for the management API: deploy, start,
//! stop, reload, test-send, session queries, resend and health. This is the
//! runtime's whole management contract — configuration editing, users and
//! dashboards live elsewhere and only ever call these verbs.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tracing::info;

use crate::config::ProductionDocument;
use crate::domain::{ItemName, MessageId, ProjectId};
use crate::engine::ProductionEngine;
use crate::error::EngineError;
use crate::store::SessionFilter;

/// Error envelope returned by every verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, details) = match &self.0 {
            EngineError::InvalidConfig { items } => {
                (StatusCode::BAD_REQUEST, Some(items.clone()))
            }
            EngineError::Validation { .. } => (StatusCode::BAD_REQUEST, None),
            EngineError::UnknownTarget { .. } => (StatusCode::NOT_FOUND, None),
            EngineError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, None),
            EngineError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                details,
            }),
        )
            .into_response()
    }
}

fn parse_project(raw: &str) -> Result<ProjectId, ApiError> {
    ProjectId::try_new(raw.to_string())
        .map_err(|e| ApiError(EngineError::validation(format!("project id: {e}"))))
}

fn parse_item(raw: &str) -> Result<ItemName, ApiError> {
    ItemName::try_new(raw.to_string())
        .map_err(|e| ApiError(EngineError::validation(format!("item name: {e}"))))
}

#[derive(Debug, Deserialize)]
struct StopParams {
    #[serde(default = "default_stop_timeout_ms")]
    timeout_ms: u64,
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

/// Body of a test-send: the unframed HL7 content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSendRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendResponse {
    pub message_id: String,
}

/// Control verbs are cheap, but deploy and stop are not; keep the admin
/// plane from piling load onto a struggling engine.
const MAX_CONCURRENT_ADMIN_REQUESTS: usize = 64;

/// Builds the admin router.
pub fn create_app(engine: Arc<ProductionEngine>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/productions/{project}/deploy", post(deploy))
        .route("/api/v1/productions/{project}/start", post(start))
        .route("/api/v1/productions/{project}/stop", post(stop))
        .route(
            "/api/v1/productions/{project}/items/{item}/reload",
            post(reload_host),
        )
        .route(
            "/api/v1/productions/{project}/items/{item}/test-send",
            post(test_send),
        )
        .route("/api/v1/productions/{project}/sessions", get(list_sessions))
        .route(
            "/api/v1/productions/{project}/dead-letters",
            get(dead_letters),
        )
        .route("/api/v1/sessions/{session_id}/trace", get(session_trace))
        .route("/api/v1/messages/{message_id}/resend", post(resend))
        .layer(
            ServiceBuilder::new()
                .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_ADMIN_REQUESTS)),
        )
        .with_state(engine)
}

/// Serves the admin API until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    engine: Arc<ProductionEngine>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_app(engine);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "admin api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(engine): State<Arc<ProductionEngine>>) -> impl IntoResponse {
    Json(engine.health())
}

async fn deploy(
    State(engine): State<Arc<ProductionEngine>>,
    Path(project): Path<String>,
    Json(document): Json<ProductionDocument>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    let summary = engine.deploy(project, document).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn start(
    State(engine): State<Arc<ProductionEngine>>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    engine.start(&project).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop(
    State(engine): State<Arc<ProductionEngine>>,
    Path(project): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    engine
        .stop(&project, Duration::from_millis(params.timeout_ms))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reload_host(
    State(engine): State<Arc<ProductionEngine>>,
    Path((project, item)): Path<(String, String)>,
    Json(new_settings): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    let item = parse_item(&item)?;
    engine.reload_host(&project, &item, new_settings).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_send(
    State(engine): State<Arc<ProductionEngine>>,
    Path((project, item)): Path<(String, String)>,
    Json(request): Json<TestSendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    let item = parse_item(&item)?;
    let report = engine
        .test_send(&project, &item, request.message.into_bytes())
        .await?;
    Ok(Json(report))
}

async fn list_sessions(
    State(engine): State<Arc<ProductionEngine>>,
    Path(project): Path<String>,
    Query(params): Query<SessionParams>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    let filter = SessionFilter {
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
        ..SessionFilter::default()
    };
    let sessions = engine.list_sessions(&project, filter).await?;
    Ok(Json(sessions))
}

async fn dead_letters(
    State(engine): State<Arc<ProductionEngine>>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = parse_project(&project)?;
    let rows = engine.dead_letters(&project).await?;
    Ok(Json(rows))
}

async fn session_trace(
    State(engine): State<Arc<ProductionEngine>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = engine.get_session_trace(&session_id).await?;
    Ok(Json(view))
}

async fn resend(
    State(engine): State<Arc<ProductionEngine>>,
    Path(message_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let parsed = message_id
        .parse::<uuid::Uuid>()
        .map_err(|e| ApiError(EngineError::validation(format!("message id: {e}"))))?;
    let new_id = engine.resend(MessageId::new(parsed)).await?;
    Ok(Json(ResendResponse {
        message_id: new_id.to_string(),
    }))
}
