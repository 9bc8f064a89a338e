//! Configuration errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("cannot write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("{path} is not valid TOML: {reason}")]
    Parse { path: String, reason: String },

    #[error("cannot encode configuration: {0}")]
    Serialize(String),

    /// An environment override that does not parse
    #[error("{key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
