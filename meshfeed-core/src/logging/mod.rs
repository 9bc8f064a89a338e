//! Logging setup
//!
//! Everything in the crate logs through `tracing` with structured fields
//! (`topic`, `peer`, `feed`, `seq`, `space`). Binaries call [`init_logging`]
//! once; `RUST_LOG` overrides the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub json_format: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            with_target: true,
            ..Default::default()
        }
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(config: &LoggingConfig) -> Result<Self, Self::Error> {
        Ok(LogConfig::new(config.level.parse()?)
            .json_format(config.json_format)
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids))
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config.level);
    let layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json_format: true,
            with_target: false,
            with_thread_ids: true,
        };
        let log = LogConfig::try_from(&config).unwrap();
        assert_eq!(log.level, LogLevel::Debug);
        assert!(log.json_format);
        assert!(!log.with_target);
        assert!(log.with_thread_ids);
    }

    #[test]
    fn test_bad_level_is_rejected() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(LogConfig::try_from(&config).is_err());
    }

    #[test]
    fn test_second_init_fails() {
        // Whichever test installs first wins; the second must report it.
        let first = init_logging(LogConfig::new(LogLevel::Warn));
        let second = init_logging(LogConfig::new(LogLevel::Warn));
        assert!(first.is_ok() || second.is_err());
        assert!(matches!(second, Err(LoggingError::InitializationFailed(_))));
    }
}
