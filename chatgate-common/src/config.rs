//! Configuration management for the gateway.
//!
//! The gateway reads an optional JSON file at `~/.chatgate/config.json`
//! (or the path in `CHATGATE_CONFIG`) and then applies environment overrides.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Backend
//! - `AI_PROVIDER` → backend.provider (azure | openrouter | openai | anthropic)
//! - `AZURE_OPENAI_KEY` / `AZURE_OPENAI_ENDPOINT` / `AZURE_OPENAI_DEPLOYMENT`
//! - `OPENROUTER_API_KEY` / `OPENROUTER_MODEL`
//! - `OPENAI_API_KEY` / `OPENAI_MODEL`
//! - `ANTHROPIC_API_KEY` / `ANTHROPIC_MODEL`
//!
//! ## Tool service
//! - `MCP_HTTP_URL` → tools.url
//! - `MCP_HTTP_API_KEY` → tools.api_key
//!
//! ## Store, network, logging
//! - `REDIS_URL` → store.redis_url
//! - `CHATGATE_STORE` → store.backend
//! - `APP_HOST` → network.public_host
//! - `CHATGATE_BIND_ADDRESS` / `CHATGATE_PORT` → network.bind / network.port
//! - `LOG_LEVEL` / `LOG_FORMAT` → observability.*

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".chatgate"),
        |dirs| dirs.home_dir().join(".chatgate"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("CHATGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Listener and CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address.
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public host name the browser client is served from.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Explicit CORS origins. Empty means `https://<public_host>` plus local dev.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            public_host: default_public_host(),
            allowed_origins: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Origins allowed by the CORS layer.
    pub fn cors_origins(&self) -> Vec<String> {
        if !self.allowed_origins.is_empty() {
            return self.allowed_origins.clone();
        }
        vec![
            format!("https://{}", self.public_host),
            "http://localhost:3000".to_string(),
        ]
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

fn default_public_host() -> String {
    "ai.yourcompany.com".into()
}

// ============================================================================
// Backend Configuration
// ============================================================================

/// Text-generation backend selection.
///
/// Exactly one variant is active per process. Credentials are optional at
/// parse time; the server refuses to resolve a variant whose required fields
/// are missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Azure OpenAI deployment.
    Azure {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default = "default_azure_deployment")]
        deployment: String,
        #[serde(default = "default_azure_api_version")]
        api_version: String,
    },
    /// OpenRouter multi-model gateway.
    OpenRouter {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_openrouter_model")]
        model: String,
    },
    /// OpenAI platform.
    OpenAi {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_openai_model")]
        model: String,
    },
    /// Anthropic messages API.
    Anthropic {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_anthropic_model")]
        model: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Azure {
            api_key: None,
            endpoint: None,
            deployment: default_azure_deployment(),
            api_version: default_azure_api_version(),
        }
    }
}

impl BackendConfig {
    /// Provider names accepted by `AI_PROVIDER`.
    pub const PROVIDERS: &'static [&'static str] = &["azure", "openrouter", "openai", "anthropic"];

    /// Build a variant with default model settings and no credentials.
    pub fn named(provider: &str) -> crate::Result<Self> {
        match provider.trim().to_lowercase().as_str() {
            "azure" => Ok(Self::Azure {
                api_key: None,
                endpoint: None,
                deployment: default_azure_deployment(),
                api_version: default_azure_api_version(),
            }),
            "openrouter" => Ok(Self::OpenRouter {
                api_key: None,
                model: default_openrouter_model(),
            }),
            "openai" => Ok(Self::OpenAi {
                api_key: None,
                model: default_openai_model(),
            }),
            "anthropic" => Ok(Self::Anthropic {
                api_key: None,
                model: default_anthropic_model(),
            }),
            other => Err(Error::Config(format!(
                "Unsupported AI provider: {other} (expected one of {})",
                Self::PROVIDERS.join(", ")
            ))),
        }
    }

    /// Provider name of the active variant.
    pub const fn provider_name(&self) -> &'static str {
        match self {
            Self::Azure { .. } => "azure",
            Self::OpenRouter { .. } => "openrouter",
            Self::OpenAi { .. } => "openai",
            Self::Anthropic { .. } => "anthropic",
        }
    }

    /// Model identity reported to clients (the deployment name for Azure).
    pub fn model(&self) -> &str {
        match self {
            Self::Azure { deployment, .. } => deployment,
            Self::OpenRouter { model, .. }
            | Self::OpenAi { model, .. }
            | Self::Anthropic { model, .. } => model,
        }
    }

    /// First required field that is absent or blank, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        fn blank(value: &Option<String>) -> bool {
            value.as_deref().map_or(true, |v| v.trim().is_empty())
        }

        match self {
            Self::Azure {
                api_key, endpoint, ..
            } => {
                if blank(api_key) {
                    Some("api_key")
                } else if blank(endpoint) {
                    Some("endpoint")
                } else {
                    None
                }
            }
            Self::OpenRouter { api_key, .. }
            | Self::OpenAi { api_key, .. }
            | Self::Anthropic { api_key, .. } => blank(api_key).then_some("api_key"),
        }
    }

    /// Overlay credential/model values from a variable lookup onto the active variant.
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        match self {
            Self::Azure {
                api_key,
                endpoint,
                deployment,
                ..
            } => {
                if let Some(v) = lookup("AZURE_OPENAI_KEY") {
                    *api_key = Some(v);
                }
                if let Some(v) = lookup("AZURE_OPENAI_ENDPOINT") {
                    *endpoint = Some(v);
                }
                if let Some(v) = lookup("AZURE_OPENAI_DEPLOYMENT") {
                    *deployment = v;
                }
            }
            Self::OpenRouter { api_key, model } => {
                if let Some(v) = lookup("OPENROUTER_API_KEY") {
                    *api_key = Some(v);
                }
                if let Some(v) = lookup("OPENROUTER_MODEL") {
                    *model = v;
                }
            }
            Self::OpenAi { api_key, model } => {
                if let Some(v) = lookup("OPENAI_API_KEY") {
                    *api_key = Some(v);
                }
                if let Some(v) = lookup("OPENAI_MODEL") {
                    *model = v;
                }
            }
            Self::Anthropic { api_key, model } => {
                if let Some(v) = lookup("ANTHROPIC_API_KEY") {
                    *api_key = Some(v);
                }
                if let Some(v) = lookup("ANTHROPIC_MODEL") {
                    *model = v;
                }
            }
        }
    }
}

fn default_azure_deployment() -> String {
    "gpt-4o".into()
}

fn default_azure_api_version() -> String {
    "2024-08-01-preview".into()
}

fn default_openrouter_model() -> String {
    "anthropic/claude-3.5-sonnet".into()
}

fn default_openai_model() -> String {
    "gpt-4o".into()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".into()
}

// ============================================================================
// Tool Service Configuration
// ============================================================================

/// External tool-discovery/invocation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServiceConfig {
    /// Service root URL. Tools are disabled when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token sent with every call.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

impl Default for ToolServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_tool_timeout(),
        }
    }
}

fn default_tool_timeout() -> u64 {
    30
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Shared expiring key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend type (redis, memory)
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Redis URL (redis://host:port).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_store_backend() -> String {
    "redis".into()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}

// ============================================================================
// Agent Configuration
// ============================================================================

/// Chat-turn behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt sent with every turn.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Longest accepted chat message, in characters.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Maximum backend rounds per turn when the model keeps calling tools.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_message_chars: default_max_message_chars(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant with access to various tools.".into()
}

fn default_max_message_chars() -> usize {
    10_000
}

fn default_max_tool_rounds() -> u32 {
    3
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets pinned to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub tools: ToolServiceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply process environment overrides.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Blank values are ignored.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> crate::Result<()> {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(provider) = lookup("AI_PROVIDER") {
            let selected = BackendConfig::named(&provider)?;
            if selected.provider_name() != self.backend.provider_name() {
                self.backend = selected;
            }
        }
        self.backend.apply_overrides(&lookup);

        if let Some(url) = lookup("MCP_HTTP_URL") {
            self.tools.url = Some(url);
        }
        if let Some(key) = lookup("MCP_HTTP_API_KEY") {
            self.tools.api_key = Some(key);
        }

        if let Some(url) = lookup("REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(backend) = lookup("CHATGATE_STORE") {
            self.store.backend = backend;
        }

        if let Some(host) = lookup("APP_HOST") {
            self.network.public_host = host;
        }
        if let Some(bind) = lookup("CHATGATE_BIND_ADDRESS") {
            self.network.bind = bind;
        }
        if let Some(port) = lookup("CHATGATE_PORT") {
            self.network.port = port
                .parse()
                .map_err(|_| Error::Config(format!("Invalid CHATGATE_PORT: {port}")))?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.observability.log_level = level.to_lowercase();
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.observability.log_format = format.to_lowercase();
        }

        Ok(())
    }

    /// Whether an external tool service is configured.
    pub fn tools_configured(&self) -> bool {
        self.tools.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}
