//! Anthropic (Claude) messages API, streamed.

use super::sse::parse_sse_stream;
use super::{
    channel_stream, parse_arguments, ChatBackend, ChatMessage, ChatRequest, Fragment,
    FragmentSender, FragmentStream, MessageRole, ProviderError, ToolCall,
};
use async_trait::async_trait;
use chatgate_common::util::sanitize_for_log;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

const MAX_TOKENS: u32 = 4096;

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<AnthropicMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

impl AnthropicBackend {
    /// Create a new Anthropic backend.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url(api_key, model, "https://api.anthropic.com")
    }

    /// Create with custom base URL.
    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key).unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::new("anthropic", &self.model, message)
    }

    fn build_request<'a>(&'a self, request: &'a ChatRequest) -> AnthropicRequest<'a> {
        AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: &request.system,
            messages: convert_messages(&request.messages),
            stream: true,
            tools: request
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.input_schema,
                })
                .collect(),
        }
    }
}

/// Map messages onto Anthropic's alternating user/assistant turns.
///
/// Tool results travel as `tool_result` blocks in a user message; consecutive
/// results are merged into one.
fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            MessageRole::User => out.push(AnthropicMessage {
                role: "user",
                content: Value::String(message.content.clone()),
            }),
            MessageRole::Assistant => {
                if message.tool_calls.is_empty() {
                    out.push(AnthropicMessage {
                        role: "assistant",
                        content: Value::String(message.content.clone()),
                    });
                    continue;
                }

                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                blocks.extend(message.tool_calls.iter().map(|call| {
                    json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    })
                }));
                out.push(AnthropicMessage {
                    role: "assistant",
                    content: Value::Array(blocks),
                });
            }
            MessageRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                });

                match out.last_mut() {
                    Some(AnthropicMessage {
                        role: "user",
                        content: Value::Array(blocks),
                    }) => blocks.push(block),
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: Value::Array(vec![block]),
                    }),
                }
            }
        }
    }

    out
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates one streamed round.
#[derive(Debug, Default)]
struct RoundState {
    text: String,
    tool_uses: HashMap<u64, PendingToolUse>,
}

impl RoundState {
    /// Handle one SSE event. Returns `false` at end of stream.
    fn handle(
        &mut self,
        event: Option<&str>,
        data: &str,
        tx: &FragmentSender,
        error: &dyn Fn(String) -> ProviderError,
    ) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            tracing::debug!("Skipping undecodable stream event");
            return true;
        };

        let kind = event
            .or_else(|| value.get("type").and_then(Value::as_str))
            .unwrap_or_default();
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);

        match kind {
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"] == "tool_use" {
                    self.tool_uses.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input_json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            self.text.push_str(text);
                            let _ = tx.send(Ok(Fragment::Text(self.text.clone())));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(pending) = self.tool_uses.get_mut(&index) {
                            pending
                                .input_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(pending) = self.tool_uses.remove(&index) {
                    let _ = tx.send(Ok(Fragment::ToolCall(ToolCall {
                        id: pending.id,
                        name: pending.name,
                        arguments: parse_arguments(&pending.input_json),
                    })));
                }
            }
            "message_stop" => return false,
            "error" => {
                let message = value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                let _ = tx.send(Err(error(format!("Stream error: {message}"))));
                return false;
            }
            _ => {}
        }

        true
    }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request(&request);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                body = %sanitize_for_log(&body),
                "Anthropic API error"
            );
            return Err(self
                .error(format!("API error ({})", status.as_u16()))
                .with_status(status.as_u16()));
        }

        let (tx, stream) = channel_stream();
        let model = self.model.clone();

        tokio::spawn(async move {
            let error = |message: String| ProviderError::new("anthropic", &model, message);
            let mut state = RoundState::default();

            let result = parse_sse_stream(response, |event| {
                state.handle(event.event.as_deref(), &event.data, &tx, &error)
            })
            .await;

            if let Err(e) = result {
                let _ = tx.send(Err(error(format!("Stream interrupted: {e}"))));
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(name: &str, data: Value) -> String {
        format!("event: {name}\ndata: {data}\n\n")
    }

    #[test]
    fn test_tool_results_merged_into_one_user_turn() {
        let messages = vec![
            ChatMessage::user("Find docs"),
            ChatMessage::assistant(
                "Searching.",
                vec![
                    ToolCall {
                        id: "tu_1".into(),
                        name: "search".into(),
                        arguments: json!({"q": "a"}),
                    },
                    ToolCall {
                        id: "tu_2".into(),
                        name: "search".into(),
                        arguments: json!({"q": "b"}),
                    },
                ],
            ),
            ChatMessage::tool_result("tu_1", "A"),
            ChatMessage::tool_result("tu_2", "B"),
        ];

        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[1].content[0]["type"], "text");
        assert_eq!(converted[1].content[2]["id"], "tu_2");
        assert_eq!(converted[2].role, "user");
        assert_eq!(converted[2].content.as_array().unwrap().len(), 2);
        assert_eq!(converted[2].content[1]["tool_use_id"], "tu_2");
    }

    #[tokio::test]
    async fn test_stream_text_and_tool_use() {
        let server = MockServer::start().await;
        let body = [
            event("message_start", json!({"type": "message_start", "message": {}})),
            event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""}
                }),
            ),
            event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": "Let me "}
                }),
            ),
            event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": "check."}
                }),
            ),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 1,
                    "content_block": {
                        "type": "tool_use",
                        "id": "tu_9",
                        "name": "search",
                        "input": {}
                    }
                }),
            ),
            event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": "{\"q\": \"ru"}
                }),
            ),
            event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": "st\"}"}
                }),
            ),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
            event("message_stop", json!({"type": "message_stop"})),
        ]
        .concat();

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({"stream": true, "system": "Be brief"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::with_base_url(
            "sk-ant-test",
            "claude-3-5-sonnet-20241022",
            &server.uri(),
        );
        let request = ChatRequest {
            system: "Be brief".into(),
            messages: vec![ChatMessage::user("Rust?")],
            tools: Vec::new(),
        };

        let fragments: Vec<Fragment> = backend
            .stream_chat(request)
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![
                Fragment::Text("Let me ".into()),
                Fragment::Text("Let me check.".into()),
                Fragment::ToolCall(ToolCall {
                    id: "tu_9".into(),
                    name: "search".into(),
                    arguments: json!({"q": "rust"}),
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(event(
                "error",
                json!({
                    "type": "error",
                    "error": {"type": "overloaded_error", "message": "Overloaded"}
                }),
            )))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::with_base_url("k", "claude", &server.uri());
        let items: Vec<_> = backend
            .stream_chat(ChatRequest::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        let err = items[0].as_ref().err().unwrap();
        assert_eq!(err.provider, "anthropic");
        assert!(err.message.contains("Overloaded"));
    }

    #[tokio::test]
    async fn test_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::with_base_url("k", "claude", &server.uri());
        let err = backend.stream_chat(ChatRequest::default()).await.err().unwrap();
        assert_eq!(err.status_code, Some(529));
    }
}
