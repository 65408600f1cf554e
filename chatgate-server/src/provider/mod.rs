//! Streaming chat backends.
//!
//! Every provider variant sits behind one [`ChatBackend`] capability. Adapters
//! normalize their wire format into [`Fragment`]s at this boundary, so the
//! turn loop never inspects provider-specific chunk shapes.

mod anthropic;
mod compatible;
pub mod sse;

pub use anthropic::AnthropicBackend;
pub use compatible::{AuthStyle, CompatibleBackend};

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use chatgate_common::BackendConfig;

use crate::tools::ToolDescriptor;

// ============================================================================
// Backend Trait
// ============================================================================

/// A resolved streaming text-generation capability.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Provider name (azure, openrouter, openai, anthropic).
    fn provider(&self) -> &str;

    /// Model or deployment name.
    fn model(&self) -> &str;

    /// Start one generation round.
    ///
    /// Errors before the first byte are returned directly; failures mid-stream
    /// arrive as an `Err` item and end the stream.
    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError>;
}

/// Normalized backend output.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Everything generated so far in this round.
    Text(String),
    /// A completed tool call request.
    ToolCall(ToolCall),
}

/// Stream of fragments for one round.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// Sending half used by adapters that pump a response from a background task.
pub(crate) type FragmentSender = mpsc::UnboundedSender<Result<Fragment, ProviderError>>;

/// Wrap a channel receiver as a [`FragmentStream`].
///
/// The producer keeps running if the stream is dropped; its sends just fail.
pub(crate) fn channel_stream() -> (FragmentSender, FragmentStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (tx, Box::pin(stream))
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: &str, model: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// The selected backend variant lacks a required field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{variant} backend is missing required field `{field}`")]
pub struct ConfigurationError {
    pub variant: String,
    pub field: String,
}

// ============================================================================
// Request Types
// ============================================================================

/// One generation round.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
}

/// Message roles understood by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// A message in the round's conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Calls requested by an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// For tool results, the call being answered.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Parse streamed argument JSON. Empty means no arguments.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Tool call arguments are not valid JSON");
        Value::Object(Default::default())
    })
}

// ============================================================================
// Resolution
// ============================================================================

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Resolve configuration into the single active backend.
pub fn resolve(config: &BackendConfig) -> Result<Arc<dyn ChatBackend>, ConfigurationError> {
    if let Some(field) = config.missing_field() {
        return Err(ConfigurationError {
            variant: config.provider_name().to_string(),
            field: field.to_string(),
        });
    }

    let backend: Arc<dyn ChatBackend> = match config {
        BackendConfig::Azure {
            api_key,
            endpoint,
            deployment,
            api_version,
        } => {
            let endpoint = endpoint.as_deref().unwrap_or_default().trim_end_matches('/');
            let url = format!(
                "{endpoint}/openai/deployments/{deployment}/chat/completions\
                 ?api-version={api_version}"
            );
            Arc::new(CompatibleBackend::new(
                "azure",
                deployment,
                &url,
                api_key.as_deref(),
                AuthStyle::Custom("api-key".into()),
            ))
        }
        BackendConfig::OpenRouter { api_key, model } => Arc::new(CompatibleBackend::new(
            "openrouter",
            model,
            OPENROUTER_CHAT_URL,
            api_key.as_deref(),
            AuthStyle::Bearer,
        )),
        BackendConfig::OpenAi { api_key, model } => Arc::new(CompatibleBackend::new(
            "openai",
            model,
            OPENAI_CHAT_URL,
            api_key.as_deref(),
            AuthStyle::Bearer,
        )),
        BackendConfig::Anthropic { api_key, model } => Arc::new(AnthropicBackend::new(
            api_key.as_deref().unwrap_or_default(),
            model,
        )),
    };

    tracing::info!(
        provider = backend.provider(),
        model = backend.model(),
        "Chat backend resolved"
    );

    Ok(backend)
}
