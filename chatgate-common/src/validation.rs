//! Configuration validation.
//!
//! Checks that configured values are present and within valid ranges before
//! the server starts. Backend credentials are not checked here: the server
//! enforces them when it resolves the backend.

use thiserror::Error;

use crate::config::{
    AgentConfig, Config, NetworkConfig, ObservabilityConfig, StoreConfig, ToolServiceConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "pretty"];
const STORE_BACKENDS: &[&str] = &["redis", "memory"];

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors: Vec<ValidationError> = [
            self.network.validate(),
            self.tools.validate(),
            self.store.validate(),
            self.agent.validate(),
            self.observability.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load configuration with environment overrides and validate it.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for NetworkConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "network.port".into(),
            });
        }

        if self.bind.parse::<std::net::IpAddr>().is_err() {
            return Err(ValidationError::InvalidValue {
                field: "network.bind".into(),
                reason: format!("not an IP address: {}", self.bind),
            });
        }

        Ok(())
    }
}

impl Validate for ToolServiceConfig {
    fn validate(&self) -> ValidationResult<()> {
        if let Some(ref raw) = self.url {
            let parsed = url::Url::parse(raw).map_err(|e| ValidationError::InvalidValue {
                field: "tools.url".into(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::InvalidValue {
                    field: "tools.url".into(),
                    reason: format!("unsupported scheme: {}", parsed.scheme()),
                });
            }
        }

        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "tools.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !STORE_BACKENDS.contains(&self.backend.as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "store.backend".into(),
                reason: format!("must be one of {}", STORE_BACKENDS.join(", ")),
            });
        }

        if self.backend == "redis" && self.redis_url.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "store.redis_url".into(),
            });
        }

        Ok(())
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_message_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "agent.max_message_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_tool_rounds == 0 {
            return Err(ValidationError::InvalidValue {
                field: "agent.max_tool_rounds".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of {}", LOG_LEVELS.join(", ")),
            });
        }

        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of {}", LOG_FORMATS.join(", ")),
            });
        }

        Ok(())
    }
}
