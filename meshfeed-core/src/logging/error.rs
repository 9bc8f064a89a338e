//! Logging errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingError {
    /// A global subscriber is already installed, or the filter is bad
    #[error("failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}
