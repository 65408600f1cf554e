//! Error types for the chatgate gateway.

use thiserror::Error;

/// Result type alias using the gateway error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the gateway's HTTP surface and startup path.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// External service error (shared store, tool service, model backend)
    #[error("External service error: {0}")]
    External(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::External(_) => 503,
            Self::Config(_) | Self::Internal(_) => 500,
        }
    }
}
