//! Error types for the Ratewarden service.

use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// Rejected requests are not errors; they surface as a
/// [`Decision`](crate::ratelimit::Decision) with `admitted == false`.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// A rate limit policy failed validation at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Layered configuration could not be loaded
    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A route asked for a limiter that was never configured
    #[error("Unknown rate limiter: {0}")]
    UnknownLimiter(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
