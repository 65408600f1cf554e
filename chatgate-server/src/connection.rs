//! Per-connection chat session.
//!
//! Each WebSocket runs one [`ConnectionSession`]:
//!
//! ```text
//! Connected → AwaitingAuth → Authenticated → { Idle ⇄ ProcessingTurn } → Closed
//! ```
//!
//! The first frame must carry a `session_id`; anything else closes the socket
//! with a policy-violation code. After that every frame is a chat turn. Turn
//! failures are reported to the client as `error` events and the connection
//! stays open; only a client disconnect or transport fault ends it.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use uuid::Uuid;

use crate::memory::Role;
use crate::metrics::GatewayMetrics;
use crate::provider::{ChatMessage, ChatRequest, Fragment, ProviderError};
use crate::session::SessionError;
use crate::state::AppState;
use crate::store::StoreError;
use crate::stream::StreamReconciler;
use crate::tools::{extract_citations, render_sources};

/// Close code for a missing or invalid session.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code when the session store cannot be reached during auth.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const FAILED_TO_PROCESS: &str = "Failed to process message";

// ============================================================================
// Wire Events
// ============================================================================

/// Events sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthSuccess {
        message: String,
        provider: String,
        model: String,
    },
    Chunk {
        content: String,
        chunk_id: u64,
        response_id: String,
    },
    Sources {
        content: String,
        chunk_id: u64,
        response_id: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// ============================================================================
// Client Channel
// ============================================================================

/// The client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

/// Transport seen by a connection session.
#[async_trait]
pub trait ClientChannel: Send {
    /// Next text frame from the client, or `None` once it is gone.
    async fn recv(&mut self) -> Option<String>;

    /// Send one event.
    async fn send(&mut self, event: &ServerEvent) -> Result<(), ChannelClosed>;

    /// Close with a code and reason.
    async fn close(&mut self, code: u16, reason: &str);
}

/// [`ClientChannel`] over an axum WebSocket.
pub struct WebSocketChannel {
    socket: WebSocket,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ClientChannel for WebSocketChannel {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket read error");
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), ChannelClosed> {
        let json = serde_json::to_string(event).map_err(|e| {
            tracing::error!(error = %e, "Failed to encode server event");
            ChannelClosed
        })?;
        futures_util::SinkExt::send(&mut self.socket, Message::Text(json))
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        let _ = futures_util::SinkExt::send(&mut self.socket, Message::Close(Some(frame))).await;
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    AwaitingAuth,
    Authenticated,
    Idle,
    ProcessingTurn,
    Closed,
}

/// Decrements the active-connection gauge however the session ends.
struct ConnectionGuard(Arc<dyn GatewayMetrics>);

impl ConnectionGuard {
    fn open(metrics: Arc<dyn GatewayMetrics>) -> Self {
        metrics.connection_opened();
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

#[derive(Debug)]
enum TurnError {
    Closed,
    Provider(ProviderError),
    Store(StoreError),
}

impl From<ChannelClosed> for TurnError {
    fn from(_: ChannelClosed) -> Self {
        Self::Closed
    }
}

impl From<ProviderError> for TurnError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl From<StoreError> for TurnError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// One client connection.
pub struct ConnectionSession<C: ClientChannel> {
    channel: C,
    state: Arc<AppState>,
    status: ConnectionState,
}

impl<C: ClientChannel> ConnectionSession<C> {
    pub fn new(channel: C, state: Arc<AppState>) -> Self {
        Self {
            channel,
            state,
            status: ConnectionState::Connected,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(from = ?self.status, to = ?next, "Connection state");
        self.status = next;
    }

    /// Drive the connection until it closes. Returns the final state.
    pub async fn run(mut self) -> ConnectionState {
        let _guard = ConnectionGuard::open(self.state.metrics.clone());
        self.transition(ConnectionState::AwaitingAuth);

        if let Some(session_id) = self.authenticate().await {
            self.transition(ConnectionState::Authenticated);
            tracing::info!(session_id = %session_id, "WebSocket authenticated");

            self.transition(ConnectionState::Idle);
            while let Some(frame) = self.channel.recv().await {
                self.transition(ConnectionState::ProcessingTurn);
                if self.handle_frame(&session_id, &frame).await.is_err() {
                    break;
                }
                self.transition(ConnectionState::Idle);
            }

            tracing::info!(session_id = %session_id, "Client disconnected");
        }

        self.transition(ConnectionState::Closed);
        self.status
    }

    async fn authenticate(&mut self) -> Option<String> {
        let frame = self.channel.recv().await?;

        let session_id = serde_json::from_str::<Value>(&frame)
            .ok()
            .and_then(|v| v.get("session_id").and_then(Value::as_str).map(str::to_string))
            .filter(|id| !id.trim().is_empty());

        let Some(session_id) = session_id else {
            tracing::warn!("WebSocket auth frame missing session_id");
            self.channel
                .close(CLOSE_POLICY_VIOLATION, "Missing session_id")
                .await;
            return None;
        };

        let sessions = &self.state.sessions;
        let result = match sessions.validate(&session_id).await {
            Ok(_) => sessions.touch(&session_id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {}
            Err(SessionError::Invalid) => {
                tracing::warn!(session_id = %session_id, "Invalid session");
                self.channel
                    .close(CLOSE_POLICY_VIOLATION, "Invalid session")
                    .await;
                return None;
            }
            Err(SessionError::Store(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "Session store unavailable");
                self.channel
                    .close(CLOSE_INTERNAL_ERROR, "Session store unavailable")
                    .await;
                return None;
            }
        }

        let event = ServerEvent::AuthSuccess {
            message: "Authenticated successfully".into(),
            provider: self.state.backend.provider().to_string(),
            model: self.state.backend.model().to_string(),
        };
        self.channel.send(&event).await.ok()?;

        Some(session_id)
    }

    /// Handle one inbound frame. `Err` means the client is gone.
    async fn handle_frame(&mut self, session_id: &str, frame: &str) -> Result<(), ChannelClosed> {
        let message = match parse_chat_message(frame, self.state.agent.max_message_chars) {
            Ok(message) => message,
            Err(reason) => return self.channel.send(&ServerEvent::error(reason)).await,
        };

        self.state.metrics.message_processed();
        tracing::info!(
            session_id = %session_id,
            message_length = message.chars().count(),
            "Processing message"
        );

        match self.process_turn(session_id, &message).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, "Message processed successfully");
                Ok(())
            }
            Err(TurnError::Closed) => Err(ChannelClosed),
            Err(err) => {
                let provider = self.state.backend.provider().to_string();
                self.state.metrics.provider_error(&provider);
                tracing::error!(
                    session_id = %session_id,
                    provider = %provider,
                    error = ?err,
                    "Error processing message"
                );
                self.channel.send(&ServerEvent::error(FAILED_TO_PROCESS)).await
            }
        }
    }

    async fn process_turn(&mut self, session_id: &str, message: &str) -> Result<(), TurnError> {
        let state = self.state.clone();
        let response_id = Uuid::new_v4().to_string();

        let context = state.memory.render_context(session_id).await?;
        state.memory.append(session_id, Role::User, message).await?;

        let mut request = ChatRequest {
            system: format!(
                "{}\n\nRecent conversation:\n{}",
                state.agent.system_prompt, context
            ),
            messages: vec![ChatMessage::user(message)],
            tools: state.tools.tools_for_turn().await,
        };

        let mut reconciler = StreamReconciler::new(response_id.clone());
        let mut full_text = String::new();
        let mut tool_results: Vec<Value> = Vec::new();
        let max_rounds = state.agent.max_tool_rounds.max(1);

        for round in 1..=max_rounds {
            reconciler.begin_round();
            let mut stream = state.backend.stream_chat(request.clone()).await?;
            let mut round_text = String::new();
            let mut calls = Vec::new();

            while let Some(item) = stream.next().await {
                match item? {
                    Fragment::Text(text) => {
                        if let Some(delta) = reconciler.push(&text) {
                            full_text.push_str(&delta.text);
                            self.channel
                                .send(&ServerEvent::Chunk {
                                    content: delta.text,
                                    chunk_id: delta.sequence,
                                    response_id: delta.response_id,
                                })
                                .await?;
                        }
                        round_text = text;
                    }
                    Fragment::ToolCall(call) => calls.push(call),
                }
            }

            if calls.is_empty() {
                break;
            }
            if round == max_rounds {
                tracing::warn!(
                    response_id = %response_id,
                    pending = calls.len(),
                    "Tool round limit reached"
                );
                break;
            }

            request
                .messages
                .push(ChatMessage::assistant(round_text, calls.clone()));

            for call in calls {
                tracing::info!(response_id = %response_id, tool = %call.name, "Invoking tool");
                let payload = match state.tools.invoke_tool(&call.name, &call.arguments).await {
                    Ok(result) => {
                        tool_results.push(result.clone());
                        result
                    }
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                        e.to_payload()
                    }
                };
                request
                    .messages
                    .push(ChatMessage::tool_result(call.id, payload.to_string()));
            }
        }

        if reconciler.anomalies() > 0 {
            tracing::info!(
                response_id = %response_id,
                anomalies = reconciler.anomalies(),
                "Backend stream was not cumulative"
            );
        }

        if let Err(e) = state
            .memory
            .append(session_id, Role::Assistant, &full_text)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to record assistant turn");
        }

        let citations = extract_citations(&tool_results);
        if !citations.is_empty() {
            self.channel
                .send(&ServerEvent::Sources {
                    content: render_sources(&citations),
                    chunk_id: reconciler.next_sequence(),
                    response_id: response_id.clone(),
                })
                .await?;
        }

        self.channel.send(&ServerEvent::Done).await?;
        Ok(())
    }
}

/// Extract chat text from a frame, or the error message to send back.
fn parse_chat_message(frame: &str, max_chars: usize) -> Result<String, &'static str> {
    #[derive(Deserialize)]
    struct ChatFrame {
        #[serde(default)]
        message: Option<Value>,
    }

    let parsed: ChatFrame = serde_json::from_str(frame).map_err(|_| "Invalid message format")?;

    let text = match parsed.message {
        None | Some(Value::Null) => return Err("Empty message"),
        Some(Value::String(text)) => text,
        Some(_) => return Err("Invalid message format"),
    };

    let text = text.trim();
    if text.is_empty() {
        return Err("Empty message");
    }
    if text.chars().count() > max_chars {
        return Err("Message too long");
    }

    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMetrics;
    use crate::provider::{channel_stream, ChatBackend, FragmentStream, ToolCall};
    use crate::store::{InMemoryStore, KvStore};
    use crate::tools::ToolGateway;
    use chatgate_common::AgentConfig;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeChannel {
        inbound: VecDeque<String>,
        sent: Arc<Mutex<Vec<ServerEvent>>>,
        closed: Arc<Mutex<Option<(u16, String)>>>,
        fail_sends_after: Option<usize>,
    }

    impl FakeChannel {
        fn with_frames(frames: &[Value]) -> Self {
            Self {
                inbound: frames.iter().map(ToString::to_string).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ClientChannel for FakeChannel {
        async fn recv(&mut self) -> Option<String> {
            self.inbound.pop_front()
        }

        async fn send(&mut self, event: &ServerEvent) -> Result<(), ChannelClosed> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_sends_after.is_some_and(|n| sent.len() >= n) {
                return Err(ChannelClosed);
            }
            sent.push(event.clone());
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: &str) {
            *self.closed.lock().unwrap() = Some((code, reason.to_string()));
        }
    }

    type Round = Vec<Result<Fragment, ProviderError>>;

    struct ScriptedBackend {
        rounds: Mutex<VecDeque<Round>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(rounds: Vec<Round>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn texts(fragments: &[&str]) -> Round {
            fragments
                .iter()
                .map(|t| Ok(Fragment::Text((*t).to_string())))
                .collect()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn provider(&self) -> &str {
            "openai"
        }

        fn model(&self) -> &str {
            "gpt-4o"
        }

        async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let round = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ProviderError::new("openai", "gpt-4o", "no scripted round"))?;

            let (tx, stream) = channel_stream();
            for item in round {
                let _ = tx.send(item);
            }
            Ok(stream)
        }
    }

    struct Harness {
        state: Arc<AppState>,
        metrics: Arc<CounterMetrics>,
        backend: Arc<ScriptedBackend>,
        session_id: String,
    }

    async fn harness(backend: Arc<ScriptedBackend>, tools: ToolGateway) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(CounterMetrics::new());
        let state = Arc::new(AppState::new(
            store,
            backend.clone(),
            Arc::new(tools),
            metrics.clone(),
            AgentConfig::default(),
        ));
        let session_id = state.sessions.create().await.unwrap();
        Harness {
            state,
            metrics,
            backend,
            session_id,
        }
    }

    type RunOutcome = (ConnectionState, Vec<ServerEvent>, Option<(u16, String)>);

    async fn run(h: &Harness, channel: FakeChannel) -> RunOutcome {
        let sent = channel.sent.clone();
        let closed = channel.closed.clone();
        let final_state = ConnectionSession::new(channel, h.state.clone()).run().await;
        let events = sent.lock().unwrap().clone();
        let closed = closed.lock().unwrap().clone();
        (final_state, events, closed)
    }

    fn chunks(events: &[ServerEvent]) -> Vec<(String, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Chunk {
                    content, chunk_id, ..
                } => Some((content.clone(), *chunk_id)),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_event_wire_format() {
        assert_eq!(serde_json::to_value(ServerEvent::Done).unwrap(), json!({"type": "done"}));
        assert_eq!(
            serde_json::to_value(ServerEvent::Chunk {
                content: "Hi".into(),
                chunk_id: 1,
                response_id: "r".into()
            })
            .unwrap(),
            json!({"type": "chunk", "content": "Hi", "chunk_id": 1, "response_id": "r"})
        );
    }

    #[test]
    fn test_parse_chat_message() {
        assert_eq!(parse_chat_message(r#"{"message": "  hi  "}"#, 10), Ok("hi".into()));
        assert_eq!(parse_chat_message(r#"{"message": "   "}"#, 10), Err("Empty message"));
        assert_eq!(parse_chat_message(r#"{}"#, 10), Err("Empty message"));
        assert_eq!(parse_chat_message(r#"{"message": 5}"#, 10), Err("Invalid message format"));
        assert_eq!(parse_chat_message("hello", 10), Err("Invalid message format"));
        assert_eq!(
            parse_chat_message(r#"{"message": "12345678901"}"#, 10),
            Err("Message too long")
        );
    }

    #[tokio::test]
    async fn test_full_turn() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::texts(&[
            "Hi", "Hi there", "Hi there", "Hi there!",
        ])]);
        let h = harness(backend, ToolGateway::disabled()).await;

        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "Hello"}),
        ]);
        let (final_state, events, closed) = run(&h, channel).await;

        assert_eq!(final_state, ConnectionState::Closed);
        assert!(closed.is_none());
        assert_eq!(
            events[0],
            ServerEvent::AuthSuccess {
                message: "Authenticated successfully".into(),
                provider: "openai".into(),
                model: "gpt-4o".into(),
            }
        );
        assert_eq!(
            chunks(&events),
            vec![("Hi".into(), 1), (" there".into(), 2), ("!".into(), 3)]
        );
        assert_eq!(events.last(), Some(&ServerEvent::Done));
        assert_eq!(events.iter().filter(|e| **e == ServerEvent::Done).count(), 1);

        let turns = h.state.memory.recent(&h.session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].content, "Hi there!");

        assert_eq!(h.metrics.messages_processed(), 1);
        assert_eq!(h.metrics.active_connections(), 0);
        assert_eq!(h.metrics.connections_total(), 1);
    }

    #[tokio::test]
    async fn test_context_passed_to_backend() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::texts(&["First answer"]),
            ScriptedBackend::texts(&["Second answer"]),
        ]);
        let h = harness(backend, ToolGateway::disabled()).await;

        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "one"}),
            json!({"message": "two"}),
        ]);
        run(&h, channel).await;

        let requests = h.backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].system.ends_with("Recent conversation:\n"));
        assert!(requests[1]
            .system
            .ends_with("User: one\nAssistant: First answer"));
        assert!(!requests[1].system.contains("User: two"));
        assert_eq!(requests[1].messages, vec![ChatMessage::user("two")]);
    }

    #[tokio::test]
    async fn test_missing_session_id_closes() {
        let h = harness(ScriptedBackend::new(vec![]), ToolGateway::disabled()).await;
        let channel = FakeChannel::with_frames(&[json!({"hello": "there"})]);
        let (final_state, events, closed) = run(&h, channel).await;

        assert_eq!(final_state, ConnectionState::Closed);
        assert!(events.is_empty());
        assert_eq!(closed, Some((1008, "Missing session_id".into())));
        assert_eq!(h.metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_invalid_session_closes_without_processing() {
        let h = harness(ScriptedBackend::new(vec![]), ToolGateway::disabled()).await;
        let channel = FakeChannel::with_frames(&[
            json!({"session_id": "forged"}),
            json!({"message": "Hello"}),
        ]);
        let (_, events, closed) = run(&h, channel).await;

        assert!(events.is_empty());
        assert_eq!(closed, Some((1008, "Invalid session".into())));
        assert!(h.backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_is_local_error() {
        let h = harness(ScriptedBackend::new(vec![]), ToolGateway::disabled()).await;
        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": ""}),
        ]);
        let (_, events, _) = run(&h, channel).await;

        assert_eq!(events[1], ServerEvent::error("Empty message"));
        assert!(h.backend.requests.lock().unwrap().is_empty());
        assert!(h.state.memory.recent(&h.session_id).await.unwrap().is_empty());
        assert_eq!(h.metrics.messages_processed(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_isolated_to_turn() {
        let backend = ScriptedBackend::new(vec![
            vec![
                Ok(Fragment::Text("par".into())),
                Err(ProviderError::new("openai", "gpt-4o", "connection reset")),
            ],
            ScriptedBackend::texts(&["Recovered"]),
        ]);
        let h = harness(backend, ToolGateway::disabled()).await;

        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "first"}),
            json!({"message": "second"}),
        ]);
        let (final_state, events, closed) = run(&h, channel).await;

        assert_eq!(final_state, ConnectionState::Closed);
        assert!(closed.is_none());
        assert!(events.contains(&ServerEvent::error("Failed to process message")));
        assert_eq!(events.last(), Some(&ServerEvent::Done));
        assert!(chunks(&events).iter().any(|(c, _)| c == "Recovered"));
        assert_eq!(h.metrics.provider_errors("openai"), 1);
    }

    #[tokio::test]
    async fn test_client_gone_mid_stream_ends_connection() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::texts(&["a", "ab", "abc"])]);
        let h = harness(backend, ToolGateway::disabled()).await;

        let mut channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "Hello"}),
            json!({"message": "never read"}),
        ]);
        channel.fail_sends_after = Some(2);
        let (final_state, events, _) = run(&h, channel).await;

        assert_eq!(final_state, ConnectionState::Closed);
        assert_eq!(events.len(), 2);
        assert_eq!(h.backend.requests.lock().unwrap().len(), 1);
        assert_eq!(h.metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_tool_round_emits_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/search/call"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sources": [{"url": "https://docs.rs", "title": "Docs.rs"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = ScriptedBackend::new(vec![
            vec![
                Ok(Fragment::Text("Searching".into())),
                Ok(Fragment::ToolCall(ToolCall {
                    id: "call_1".into(),
                    name: "search".into(),
                    arguments: json!({"q": "crates"}),
                })),
            ],
            ScriptedBackend::texts(&["Found", "Found it"]),
        ]);
        let tools = ToolGateway::new(Some(server.uri()), None, std::time::Duration::from_secs(5));
        let h = harness(backend, tools).await;

        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "Where are crate docs?"}),
        ]);
        let (_, events, _) = run(&h, channel).await;

        assert_eq!(
            chunks(&events),
            vec![
                ("Searching".into(), 1),
                ("Found".into(), 2),
                (" it".into(), 3)
            ]
        );

        let n = events.len();
        assert_eq!(
            events[n - 2],
            ServerEvent::Sources {
                content: "\n\n**Sources:**\n1. [Docs.rs](https://docs.rs)".into(),
                chunk_id: 4,
                response_id: match &events[1] {
                    ServerEvent::Chunk { response_id, .. } => response_id.clone(),
                    other => panic!("expected chunk, got {other:?}"),
                },
            }
        );
        assert_eq!(events[n - 1], ServerEvent::Done);

        let requests = h.backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let follow_up = &requests[1].messages;
        assert_eq!(follow_up.len(), 3);
        assert_eq!(follow_up[1].tool_calls[0].name, "search");
        assert_eq!(follow_up[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(follow_up[2].content.contains("docs.rs"));
    }

    #[tokio::test]
    async fn test_failed_tool_call_still_completes_turn() {
        let backend = ScriptedBackend::new(vec![
            vec![Ok(Fragment::ToolCall(ToolCall {
                id: "call_1".into(),
                name: "search".into(),
                arguments: json!({}),
            }))],
            ScriptedBackend::texts(&["No results"]),
        ]);
        let h = harness(backend, ToolGateway::disabled()).await;

        let channel = FakeChannel::with_frames(&[
            json!({"session_id": h.session_id}),
            json!({"message": "search"}),
        ]);
        let (_, events, _) = run(&h, channel).await;

        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Sources { .. })));
        assert_eq!(events.last(), Some(&ServerEvent::Done));

        let requests = h.backend.requests.lock().unwrap();
        assert!(requests[1].messages[2].content.contains("not configured"));
    }
}
