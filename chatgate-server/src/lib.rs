//! Chatgate Server - real-time conversational gateway.
//!
//! Clients log in for a short-lived session, open a WebSocket, and exchange
//! chat turns with one configured text-generation backend. Responses stream
//! back as ordered deltas; tool results contribute citations.
//!
//! ## Architecture
//!
//! ```text
//! Client ──ws──▶ ConnectionSession ──▶ SessionStore ──┐
//!                    │                                ├──▶ KvStore (Redis)
//!                    ├──▶ ConversationMemory ─────────┘
//!                    ├──▶ ChatBackend ──▶ StreamReconciler ──▶ client
//!                    └──▶ ToolGateway ──▶ citations
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod connection;
pub mod memory;
pub mod metrics;
pub mod provider;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod tools;

pub use connection::{ClientChannel, ConnectionSession, ConnectionState, ServerEvent};
pub use memory::{ConversationMemory, ConversationTurn, Role};
pub use metrics::{CounterMetrics, GatewayMetrics};
pub use provider::{
    resolve, AnthropicBackend, AuthStyle, ChatBackend, ChatMessage, ChatRequest,
    CompatibleBackend, ConfigurationError, Fragment, FragmentStream, ProviderError, ToolCall,
};
pub use session::{Session, SessionError, SessionStore};
pub use state::AppState;
pub use store::{create_store, InMemoryStore, KvStore, RedisStore, StoreError};
pub use stream::{StreamDelta, StreamReconciler};
pub use tools::{ToolCitation, ToolDescriptor, ToolError, ToolGateway};

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use chatgate_common::config::{Config, NetworkConfig};

/// CORS for the configured browser origins.
fn cors_layer(network: &NetworkConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = network
        .cors_origins()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: Arc<AppState>, network: &NetworkConfig) -> Router {
    routes::build_routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(network))
}

/// Build shared state from configuration.
///
/// Fails on an unreachable store or an incomplete backend configuration.
/// Tool discovery problems are logged and do not fail startup.
pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let store = create_store(&config.store)
        .await
        .context("Failed to connect to the session store")?;
    store
        .ping()
        .await
        .context("Session store did not answer PING")?;

    let backend = resolve(&config.backend)?;

    let tools = Arc::new(ToolGateway::from_config(&config.tools));
    if tools.is_configured() {
        tools.initialize().await;
        let discovered = tools.discover_tools().await;
        tracing::info!(count = discovered.len(), "Tool service initialized");
    } else {
        tracing::info!("No tool service configured");
    }

    Ok(Arc::new(AppState::new(
        store,
        backend,
        tools,
        Arc::new(CounterMetrics::new()),
        config.agent.clone(),
    )))
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.network.bind.parse::<std::net::IpAddr>()?,
        config.network.port,
    ));

    let state = build_state(config).await?;
    let router = build_router(state.clone(), &config.network);

    tracing::info!(
        provider = state.backend.provider(),
        model = state.backend.model(),
        "Starting Chatgate on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.tools.close().await;
    tracing::info!("Chatgate stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
