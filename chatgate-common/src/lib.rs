//! Chatgate Common - Shared configuration, errors, and logging for the chatgate gateway.
//!
//! This crate provides:
//! - Configuration types and loading (file + environment overrides)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Small string utilities used across the gateway

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    AgentConfig, BackendConfig, Config, NetworkConfig, ObservabilityConfig, StoreConfig,
    ToolServiceConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{BackendConfig, Config};
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
