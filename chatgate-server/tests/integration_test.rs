//! Integration tests for Chatgate.
//!
//! HTTP routes are driven through `oneshot`; the WebSocket protocol runs
//! end-to-end against a bound server with a tungstenite client.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatgate_common::{AgentConfig, NetworkConfig};
use chatgate_server::store::StoreResult;
use chatgate_server::{
    build_router, AppState, ChatBackend, ChatRequest, CounterMetrics, Fragment, FragmentStream,
    InMemoryStore, KvStore, ProviderError, StoreError, ToolGateway,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// Backend that replays the same cumulative fragments every round.
struct EchoBackend {
    fragments: Vec<String>,
}

#[async_trait]
impl ChatBackend for EchoBackend {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        "claude-3-5-sonnet-20241022"
    }

    async fn stream_chat(&self, _request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        let items: Vec<Result<Fragment, ProviderError>> = self
            .fragments
            .iter()
            .map(|f| Ok(Fragment::Text(f.clone())))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Store whose backend is always down.
struct DownStore;

#[async_trait]
impl KvStore for DownStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn push_capped(
        &self,
        _key: &str,
        _value: &str,
        _cap: usize,
        _ttl: Duration,
    ) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn list(&self, _key: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::Connection("connection refused".into()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".into()))
    }
}

fn create_state(store: Arc<dyn KvStore>, tools: ToolGateway) -> Arc<AppState> {
    let backend = Arc::new(EchoBackend {
        fragments: vec!["Hello".into(), "Hello from".into(), "Hello from chatgate".into()],
    });
    Arc::new(AppState::new(
        store,
        backend,
        Arc::new(tools),
        Arc::new(CounterMetrics::new()),
        AgentConfig::default(),
    ))
}

fn memory_state() -> Arc<AppState> {
    create_state(Arc::new(InMemoryStore::new()), ToolGateway::disabled())
}

fn create_test_app(state: Arc<AppState>) -> axum::Router {
    build_router(state, &NetworkConfig::default())
}

/// Helper to make a request and get JSON response.
async fn request_json(app: &axum::Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json)
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_service_info() {
    let app = create_test_app(memory_state());

    let (status, body) = request_json(&app, Method::GET, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "chatgate");
    assert_eq!(body["ai_provider"], "anthropic");
    assert_eq!(body["mcp_configured"], false);
    assert!(body["endpoints"]
        .as_array()
        .unwrap()
        .contains(&json!("/ws")));
}

#[tokio::test]
async fn test_health_without_tools() {
    let app = create_test_app(memory_state());

    let (status, body) = request_json(&app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["redis"], "connected");
    assert_eq!(body["mcp"], "disabled");
}

#[tokio::test]
async fn test_health_reports_tool_service() {
    let tools_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": {"tools": [{"name": "search"}]}
        })))
        .mount(&tools_server)
        .await;

    let tools = ToolGateway::new(Some(tools_server.uri()), None, Duration::from_secs(5));
    let state = create_state(Arc::new(InMemoryStore::new()), tools);
    let app = create_test_app(state.clone());

    let (_, body) = request_json(&app, Method::GET, "/health").await;
    assert_eq!(body["mcp"], "connected");
    assert!(state.tools.cached_tools().await.is_empty());
}

#[tokio::test]
async fn test_health_with_empty_tool_listing() {
    let tools_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&tools_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&tools_server)
        .await;

    let tools = ToolGateway::new(Some(tools_server.uri()), None, Duration::from_secs(5));
    let app = create_test_app(create_state(Arc::new(InMemoryStore::new()), tools));

    let (status, body) = request_json(&app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mcp"], "connected_no_tools");
}

#[tokio::test]
async fn test_health_store_down() {
    let app = create_test_app(create_state(Arc::new(DownStore), ToolGateway::disabled()));

    let (status, body) = request_json(&app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Service unhealthy");
    assert!(body["message"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_login_creates_session() {
    let state = create_state(Arc::new(InMemoryStore::new()), ToolGateway::disabled());
    let app = create_test_app(state.clone());

    let (status, body) = request_json(&app, Method::POST, "/auth/login").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Authentication successful");
    let session_id = body["session_id"].as_str().unwrap();
    assert!(state.sessions.validate(session_id).await.is_ok());
}

#[tokio::test]
async fn test_login_store_down() {
    let app = create_test_app(create_state(Arc::new(DownStore), ToolGateway::disabled()));

    let (status, body) = request_json(&app, Method::POST, "/auth/login").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to create session");
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let app = create_test_app(memory_state());

    request_json(&app, Method::GET, "/health").await;
    request_json(&app, Method::GET, "/health").await;

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total{method=\"GET\",endpoint=\"/health\"} 2"));
    assert!(text.contains("active_websockets 0"));
}

#[tokio::test]
async fn test_cors_preflight_for_local_dev_origin() {
    let app = create_test_app(memory_state());

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/auth/login")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Tests
// ─────────────────────────────────────────────────────────────────────────────

async fn spawn_server(state: Arc<AppState>) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_test_app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("connection ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_chat_turn() {
    let state = create_state(Arc::new(InMemoryStore::new()), ToolGateway::disabled());
    let session_id = state.sessions.create().await.unwrap();
    let addr = spawn_server(state.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    ws.send(Message::Text(json!({"session_id": session_id}).to_string()))
        .await
        .unwrap();
    let auth = next_json(&mut ws).await;
    assert_eq!(auth["type"], "auth_success");
    assert_eq!(auth["provider"], "anthropic");
    assert_eq!(auth["model"], "claude-3-5-sonnet-20241022");

    ws.send(Message::Text(json!({"message": "Hello"}).to_string()))
        .await
        .unwrap();

    let mut content = String::new();
    let mut chunk_ids = Vec::new();
    let mut response_ids = Vec::new();
    loop {
        let event = next_json(&mut ws).await;
        match event["type"].as_str().unwrap() {
            "chunk" => {
                content.push_str(event["content"].as_str().unwrap());
                chunk_ids.push(event["chunk_id"].as_u64().unwrap());
                response_ids.push(event["response_id"].as_str().unwrap().to_string());
            }
            "done" => break,
            other => panic!("unexpected event {other}: {event}"),
        }
    }

    assert_eq!(content, "Hello from chatgate");
    assert_eq!(chunk_ids, vec![1, 2, 3]);
    assert!(response_ids.windows(2).all(|w| w[0] == w[1]));

    ws.send(Message::Text(json!({"message": "   "}).to_string()))
        .await
        .unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error, json!({"type": "error", "message": "Empty message"}));

    ws.close(None).await.unwrap();

    let turns = state.memory.recent(&session_id).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Hello from chatgate");
}

#[tokio::test]
async fn test_websocket_invalid_session_is_closed() {
    let state = create_state(Arc::new(InMemoryStore::new()), ToolGateway::disabled());
    let addr = spawn_server(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.send(Message::Text(json!({"session_id": "not-a-session"}).to_string()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 1008);
            assert_eq!(close.reason, "Invalid session");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}
