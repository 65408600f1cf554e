//! Client for the external tool service.
//!
//! Discovery speaks a JSON-RPC `tools/list` call against the service root and
//! falls back to the legacy `GET /tools` listing when the root answers 405.
//! Tool absence never fails a chat turn: every discovery problem degrades to
//! an empty list and every invocation problem comes back as a [`ToolError`]
//! value.

mod citations;
mod types;

pub use citations::{extract_citations, render_sources};
pub use types::{ToolCitation, ToolDescriptor, ToolError};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use chatgate_common::util::{sanitize_for_log, truncate_with_ellipsis};
use chatgate_common::ToolServiceConfig;

use types::{RpcRequest, RPC_VERSION, TOOLS_LIST};

/// Minimum gap between re-discovery attempts while the tool cache is empty.
const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Tool service client.
pub struct ToolGateway {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    client: RwLock<Option<Client>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    last_discovery: RwLock<Option<Instant>>,
    next_id: AtomicU64,
}

impl ToolGateway {
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
            client: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            last_discovery: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &ToolServiceConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// A gateway with no service behind it.
    pub fn disabled() -> Self {
        Self::new(None, None, Duration::from_secs(30))
    }

    /// True iff a service endpoint is configured.
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Whether a connection is currently held.
    pub async fn is_initialized(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Build the HTTP client. No-op if already built or not configured.
    pub async fn initialize(&self) {
        if !self.is_configured() || self.client.read().await.is_some() {
            return;
        }

        let mut slot = self.client.write().await;
        if slot.is_some() {
            return;
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(&format!("Bearer {key}")) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("Tool service API key is not a valid header value"),
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        *slot = Some(client);
        tracing::debug!(url = ?self.base_url, "Tool service client initialized");
    }

    /// Drop the connection. The next call re-initializes.
    pub async fn close(&self) {
        if self.client.write().await.take().is_some() {
            tracing::debug!("Tool service client closed");
        }
    }

    async fn client(&self) -> Option<(Client, &str)> {
        let base = self.base_url.as_deref()?;
        self.initialize().await;
        let client = self.client.read().await.clone()?;
        Some((client, base))
    }

    /// Tools from the most recent successful discovery.
    pub async fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Tools to offer on a chat turn.
    ///
    /// An empty cache triggers discovery again, at most once per
    /// [`REDISCOVERY_INTERVAL`], so a service that was down at startup is
    /// picked up once it returns.
    pub async fn tools_for_turn(&self) -> Vec<ToolDescriptor> {
        let cached = self.cached_tools().await;
        if !cached.is_empty() || !self.is_configured() {
            return cached;
        }

        let due = self
            .last_discovery
            .read()
            .await
            .map_or(true, |at| at.elapsed() >= REDISCOVERY_INTERVAL);
        if due {
            self.discover_tools().await
        } else {
            cached
        }
    }

    /// Ask the service which tools it offers and refresh the cache.
    pub async fn discover_tools(&self) -> Vec<ToolDescriptor> {
        let tools = self.fetch_tools().await;
        *self.last_discovery.write().await = Some(Instant::now());
        *self.tools.write().await = tools.clone();
        tools
    }

    /// Ask the service which tools it offers without touching the cache.
    pub async fn check_tools(&self) -> Vec<ToolDescriptor> {
        self.fetch_tools().await
    }

    async fn fetch_tools(&self) -> Vec<ToolDescriptor> {
        let Some((client, base)) = self.client().await else {
            return Vec::new();
        };

        let request = RpcRequest {
            jsonrpc: RPC_VERSION,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: TOOLS_LIST,
            params: serde_json::json!({}),
        };

        let tools = match client.post(base).json(&request).send().await {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::info!("Tool service rejected tools/list, using legacy GET /tools");
                self.discover_legacy(&client, base).await
            }
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "Tool discovery failed");
                Vec::new()
            }
            Ok(response) => match response.text().await {
                Ok(body) => parse_rpc_listing(&body),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read tool listing");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Error listing tools");
                Vec::new()
            }
        };

        tracing::info!(count = tools.len(), "Discovered tools");
        tools
    }

    async fn discover_legacy(&self, client: &Client, base: &str) -> Vec<ToolDescriptor> {
        let url = format!("{base}/tools");

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Error listing tools via legacy endpoint");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Legacy tool listing failed");
            return Vec::new();
        }

        match response.json::<Value>().await {
            Ok(value) => parse_tool_list(&value),
            Err(e) => {
                tracing::warn!(error = %e, "Legacy tool listing is not JSON");
                Vec::new()
            }
        }
    }

    /// Call a tool with a JSON argument object.
    pub async fn invoke_tool(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let (client, base) = self.client().await.ok_or(ToolError::NotConfigured)?;
        let url = tool_call_url(base, name)?;

        tracing::debug!(tool = %name, "Calling tool");

        let response = client
            .post(url)
            .json(arguments)
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                tool: name.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                tool = %name,
                status = status.as_u16(),
                body = %sanitize_for_log(&truncate_with_ellipsis(&body, 200)),
                "Tool call failed"
            );
            return Err(ToolError::Status {
                tool: name.to_string(),
                status: status.as_u16(),
            });
        }

        response.json::<Value>().await.map_err(|e| ToolError::Decode {
            tool: name.to_string(),
            message: e.to_string(),
        })
    }
}

/// `{base}/tools/{name}/call`, with the name encoded as a single path segment.
fn tool_call_url(base: &str, name: &str) -> Result<Url, ToolError> {
    let invalid = || ToolError::InvalidName {
        tool: name.to_string(),
    };

    if matches!(name.trim(), "" | "." | "..") {
        return Err(invalid());
    }

    let mut url = Url::parse(base).map_err(|e| ToolError::Transport {
        tool: name.to_string(),
        message: format!("invalid tool service URL: {e}"),
    })?;
    url.path_segments_mut()
        .map_err(|()| invalid())?
        .pop_if_empty()
        .extend(["tools", name, "call"]);

    Ok(url)
}

/// Interpret a `tools/list` response body. Empty or non-JSON bodies mean no tools.
fn parse_rpc_listing(body: &str) -> Vec<ToolDescriptor> {
    if body.trim().is_empty() {
        tracing::info!("Tool service returned an empty listing");
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            tracing::info!("Tool service listing is not JSON, assuming no tools");
            return Vec::new();
        }
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        tracing::warn!(error = %error, "Tool service returned an RPC error");
        return Vec::new();
    }

    parse_tool_list(value.get("result").unwrap_or(&value))
}

/// Accept a bare list or an object holding a `tools` list.
fn parse_tool_list(value: &Value) -> Vec<ToolDescriptor> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("tools").and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(tool) => Some(tool),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed tool descriptor");
                None
            }
        })
        .collect()
}
