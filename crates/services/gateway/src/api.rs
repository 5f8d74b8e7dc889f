//! HTTP API for the voxrelay gateway
//!
//! - `GET /ws` - caller WebSocket (optional `?session_id=`)
//! - `GET /api/sessions` - list live sessions
//! - `DELETE /api/sessions/:id` - force-close a session
//! - `GET /api/metrics` - session metrics
//! - `GET /health` - liveness

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use voxrelay_core::{
    InferenceConnector, KnowledgeBase, Metrics, MetricsSnapshot, SessionRegistry, SessionSummary,
    ToolHandler,
};

use crate::config::Config;
use crate::connection;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Opens engine channels for new sessions
    pub connector: Arc<dyn InferenceConnector>,
    /// Answers `userText` commands
    pub knowledge: Arc<dyn KnowledgeBase>,
    /// Tools advertised to the engine, if any
    pub tools: Option<Arc<dyn ToolHandler>>,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn InferenceConnector>,
        knowledge: Arc<dyn KnowledgeBase>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            connector,
            knowledge,
            tools: None,
            config,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolHandler>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.registry.metrics().clone()
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Caller-chosen session id; generated when absent
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Error body for failed requests
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, params.session_id))
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    let sessions = state.registry.snapshot();
    Json(SessionList {
        count: sessions.len(),
        sessions,
    })
}

/// Force-close a session and drop it from the registry
async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.registry.lookup(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "session_not_found".to_string(),
                message: format!("Session {} not found", session_id),
            }),
        )
            .into_response();
    };

    tracing::info!(session_id = %session_id, "Closing session on request");
    if let Err(e) = session.force_close().await {
        tracing::warn!(session_id = %session_id, error = %e, "Force close reported an error");
    }
    state.registry.remove_session(&session);

    StatusCode::NO_CONTENT.into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics().snapshot())
}

async fn health_check() -> &'static str {
    "OK"
}
