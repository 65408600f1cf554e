//! OpenAI-compatible streaming chat completions.
//!
//! One implementation serves OpenAI, OpenRouter and Azure OpenAI. They differ
//! only in endpoint URL and how the key is sent.

use super::sse::parse_sse_stream;
use super::{
    channel_stream, parse_arguments, ChatBackend, ChatMessage, ChatRequest, Fragment,
    FragmentSender, FragmentStream, MessageRole, ProviderError, ToolCall,
};
use async_trait::async_trait;
use chatgate_common::util::sanitize_for_log;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How the provider expects the API key to be sent.
#[derive(Debug, Clone)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Custom header name (Azure uses `api-key`)
    Custom(String),
}

/// A backend that speaks the OpenAI chat completions streaming API.
pub struct CompatibleBackend {
    provider: String,
    model: String,
    url: String,
    api_key: Option<String>,
    auth_style: AuthStyle,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompatibleRequest<'a> {
    model: &'a str,
    messages: Vec<CompatibleMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<CompatibleTool<'a>>,
}

#[derive(Debug, Serialize)]
struct CompatibleMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<CompatibleToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompatibleToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: CompatibleFunctionCall,
}

#[derive(Debug, Serialize)]
struct CompatibleFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct CompatibleTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: CompatibleFunction<'a>,
}

#[derive(Debug, Serialize)]
struct CompatibleFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl CompatibleBackend {
    /// Create a backend posting to `url`, the full chat completions endpoint.
    pub fn new(
        provider: &str,
        model: &str,
        url: &str,
        api_key: Option<&str>,
        auth_style: AuthStyle,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            url: url.to_string(),
            api_key: api_key.map(ToString::to_string),
            auth_style,
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::new(&self.provider, &self.model, message)
    }

    fn build_request<'a>(&'a self, request: &'a ChatRequest) -> CompatibleRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if !request.system.is_empty() {
            messages.push(CompatibleMessage {
                role: "system",
                content: Some(request.system.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }

        messages.extend(request.messages.iter().map(convert_message));

        CompatibleRequest {
            model: &self.model,
            messages,
            stream: true,
            tools: request
                .tools
                .iter()
                .map(|t| CompatibleTool {
                    kind: "function",
                    function: CompatibleFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.input_schema,
                    },
                })
                .collect(),
        }
    }
}

fn convert_message(message: &ChatMessage) -> CompatibleMessage {
    match message.role {
        MessageRole::User => CompatibleMessage {
            role: "user",
            content: Some(message.content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        },
        MessageRole::Assistant => CompatibleMessage {
            role: "assistant",
            content: (!message.content.is_empty() || message.tool_calls.is_empty())
                .then(|| message.content.clone()),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| CompatibleToolCall {
                    id: call.id.clone(),
                    kind: "function",
                    function: CompatibleFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: None,
        },
        MessageRole::Tool => CompatibleMessage {
            role: "tool",
            content: Some(message.content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: message.tool_call_id.clone(),
        },
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates one streamed round.
#[derive(Debug, Default)]
struct RoundState {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl RoundState {
    /// Handle one SSE data payload. Returns `false` at end of stream.
    fn handle(
        &mut self,
        data: &str,
        tx: &FragmentSender,
        error: &dyn Fn(String) -> ProviderError,
    ) -> bool {
        let data = data.trim();
        if data == "[DONE]" {
            return false;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping undecodable stream chunk");
                return true;
            }
        };

        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| err.to_string(), ToString::to_string);
            let _ = tx.send(Err(error(format!("Stream error: {message}"))));
            return false;
        }

        let chunk: StreamChunk = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unexpected stream chunk");
                return true;
            }
        };

        let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
            return true;
        };

        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.text.push_str(&content);
            if tx.send(Ok(Fragment::Text(self.text.clone()))).is_err() {
                tracing::debug!("Fragment receiver dropped, draining backend stream");
            }
        }

        for call in delta.tool_calls.unwrap_or_default() {
            let partial = self.calls.entry(call.index).or_default();
            if let Some(id) = call.id {
                partial.id = Some(id);
            }
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    partial.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    partial.arguments.push_str(&arguments);
                }
            }
        }

        true
    }

    /// Emit accumulated tool calls in index order.
    fn finish(self, tx: &FragmentSender) {
        for (index, call) in self.calls {
            if call.name.is_empty() {
                continue;
            }
            let _ = tx.send(Ok(Fragment::ToolCall(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            })));
        }
    }
}

#[async_trait]
impl ChatBackend for CompatibleBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            self.error(format!("{} API key not set", self.provider))
        })?;

        let body = self.build_request(&request);
        let mut req = self.client.post(&self.url).json(&body);

        match &self.auth_style {
            AuthStyle::Bearer => {
                req = req.header("Authorization", format!("Bearer {api_key}"));
            }
            AuthStyle::Custom(header) => {
                req = req.header(header.as_str(), api_key);
            }
        }

        tracing::debug!(
            provider = %self.provider,
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting chat stream"
        );

        let response = req
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %self.provider,
                status = status.as_u16(),
                body = %sanitize_for_log(&error_text),
                "Chat API error"
            );
            return Err(self
                .error(format!("API error ({})", status.as_u16()))
                .with_status(status.as_u16()));
        }

        let (tx, stream) = channel_stream();
        let provider = self.provider.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            let error = |message: String| ProviderError::new(&provider, &model, message);
            let mut state = RoundState::default();

            let result =
                parse_sse_stream(response, |event| state.handle(&event.data, &tx, &error)).await;

            match result {
                Ok(()) => state.finish(&tx),
                Err(e) => {
                    let _ = tx.send(Err(error(format!("Stream interrupted: {e}"))));
                }
            }
        });

        Ok(stream)
    }
}
