//! HTTP routes: service info, health, login, metrics and the WebSocket upgrade.

use axum::{
    extract::{ws::WebSocketUpgrade, MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use chatgate_common::Error;

use crate::connection::{ConnectionSession, WebSocketChannel};
use crate::state::AppState;

/// Service info response.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    pub ai_provider: String,
    pub mcp_configured: bool,
    pub endpoints: Vec<String>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub redis: String,
    pub mcp: String,
    pub ai_provider: String,
}

/// Login response.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session_id: String,
    pub message: String,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error body with the status the gateway error maps to.
fn error_response(err: &Error, error: &str, message: Option<String>) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

/// Build every route over shared state.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(info))
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/ws", get(websocket))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());
    state.metrics.http_request(request.method().as_str(), &path);
    next.run(request).await
}

async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: "chatgate".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        ai_provider: state.backend.provider().to_string(),
        mcp_configured: state.tools.is_configured(),
        endpoints: ["/health", "/auth/login", "/ws", "/metrics"]
            .iter()
            .map(ToString::to_string)
            .collect(),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = state.store.ping().await {
        tracing::error!(error = %e, "Health check failed");
        let message = e.to_string();
        return error_response(&Error::from(e), "Service unhealthy", Some(message));
    }

    let mcp = if !state.tools.is_configured() {
        "disabled"
    } else if state.tools.check_tools().await.is_empty() {
        "connected_no_tools"
    } else {
        "connected"
    };

    Json(HealthResponse {
        status: "healthy".into(),
        redis: "connected".into(),
        mcp: mcp.into(),
        ai_provider: state.backend.provider().to_string(),
    })
    .into_response()
}

async fn login(State(state): State<Arc<AppState>>) -> Response {
    match state.sessions.create().await {
        Ok(session_id) => Json(LoginResponse {
            session_id,
            message: "Authentication successful".into(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Session creation error");
            error_response(
                &Error::Internal(e.to_string()),
                "Failed to create session",
                None,
            )
        }
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        ConnectionSession::new(WebSocketChannel::new(socket), state)
            .run()
            .await;
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
