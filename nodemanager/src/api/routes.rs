//! API routes

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::ApiError;
use super::websocket::WsManager;
use crate::launch::DEFAULT_APP;
use crate::runtime::{ProjectStats, StatsCollector, Supervisor};

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub stats: StatsCollector,
    pub ws_manager: WsManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: Supervisor) -> Self {
        let stats = supervisor.stats_collector();
        let ws_manager = WsManager::new(supervisor.events().clone());
        Self {
            supervisor,
            stats,
            ws_manager,
            started_at: Instant::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub websocket_connections: usize,
}

/// Body of the process commands
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    #[serde(default)]
    pub app_name: Option<String>,
}

impl ProcessRequest {
    /// Parse a request body. An empty body selects the default app.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    pub fn app_name(&self) -> &str {
        match self.app_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_APP,
        }
    }
}

/// Acknowledgement of a process command
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
        })
    }
}

/// Registered apps of a project
#[derive(Debug, Serialize, Deserialize)]
pub struct AppsResponse {
    pub apps: Vec<String>,
}

/// Create all API routes
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))

        // Process lifecycle
        .route("/process/{id}/start", post(start_process))
        .route("/process/{id}/stop", post(stop_process))
        .route("/process/{id}/kill", post(kill_process))
        .route("/process/{id}/restart", post(restart_process))

        // Observation
        .route("/process/{id}/stats", get(process_stats))
        .route("/process/{id}/apps", get(running_apps))

        .with_state(state)
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        websocket_connections: state.ws_manager.connection_count().await,
    })
}

async fn start_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ApiError> {
    let req = ProcessRequest::from_body(&body)?;
    state.supervisor.start(&id, req.app_name()).await?;
    Ok(ActionResponse::ok())
}

async fn stop_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ApiError> {
    let req = ProcessRequest::from_body(&body)?;
    state.supervisor.stop(&id, req.app_name()).await?;
    Ok(ActionResponse::ok())
}

async fn kill_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ApiError> {
    let req = ProcessRequest::from_body(&body)?;
    state.supervisor.kill(&id, req.app_name()).await?;
    Ok(ActionResponse::ok())
}

async fn restart_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ApiError> {
    let req = ProcessRequest::from_body(&body)?;
    let mode = state.supervisor.restart(&id, req.app_name()).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: Some(mode.message().to_string()),
    }))
}

async fn process_stats(State(state): State<AppState>, Path(id): Path<String>) -> Json<ProjectStats> {
    Json(state.stats.stats(&id).await)
}

async fn running_apps(State(state): State<AppState>, Path(id): Path<String>) -> Json<AppsResponse> {
    Json(AppsResponse {
        apps: state.supervisor.running_apps(&id),
    })
}
