//! Configuration management for meshfeed
//!
//! Defaults, TOML files and `MESHFEED_<SECTION>_<KEY>` environment
//! overrides, validated before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_replication::MAX_MESSAGE_SIZE;
use crate::core_runtime::BackoffPolicy;

/// Main node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub signaling: SignalingConfig,
    pub swarm: SwarmConfig,
    pub teleport: TeleportConfig,
    pub presence: PresenceConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

/// Signaling client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// How long an offer waits for its answer
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub reconnect_base: Duration,

    #[serde(with = "humantime_serde")]
    pub reconnect_cap: Duration,

    /// Failures before joined topics are reported degraded
    pub max_reconnect_attempts: u32,
}

/// Swarm connection management
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Reconcile tick
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,

    /// Failed attempts before a peer is marked unreachable
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub unreachable_cooldown: Duration,

    /// How long the larger key waits for the smaller key to initiate
    /// before initiating itself
    #[serde(with = "humantime_serde")]
    pub passive_grace: Duration,
}

/// Teleport multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleportConfig {
    /// Per-channel receive window in bytes
    pub initial_credit: u32,

    pub max_frame_size: u32,

    /// Largest message a channel reassembles from fragments
    pub max_message_size: u32,
}

/// Liveness over the presence channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Interval between Alive messages
    #[serde(with = "humantime_serde")]
    pub alive_interval: Duration,

    /// Silence after which a connection is closed
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

/// Feed replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Gap age before a Request is sent
    #[serde(with = "humantime_serde")]
    pub gap_timeout: Duration,

    /// Out-of-order messages held per feed
    pub max_buffered_per_feed: usize,

    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Interval of Timeframe progress messages
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,

    /// Capacity of the space event broadcast
    pub event_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub json_format: bool,

    pub with_target: bool,

    pub with_thread_ids: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

impl SignalingConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.reconnect_base,
            cap: self.reconnect_cap,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            max_retries: 5,
            unreachable_cooldown: Duration::from_secs(60),
            passive_grace: Duration::from_secs(10),
        }
    }
}

impl SwarmConfig {
    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.retry_base,
            cap: self.retry_cap,
            max_attempts: self.max_retries,
        }
    }
}

impl Default for TeleportConfig {
    fn default() -> Self {
        Self {
            initial_credit: 1024 * 1024,
            max_frame_size: 4 * 1024 * 1024,
            max_message_size: 32 * 1024 * 1024,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            alive_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            gap_timeout: Duration::from_secs(5),
            max_buffered_per_feed: 1024,
            handshake_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_secs(2),
            event_capacity: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

impl MeshConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: MESHFEED_<SECTION>_<KEY>
    /// Example: MESHFEED_SWARM_CONNECT_TIMEOUT=5s
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`MeshConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        macro_rules! set {
            ($key:literal, $field:expr, duration) => {
                if let Some(raw) = lookup($key) {
                    $field = parse_duration($key, &raw)?;
                }
            };
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse_value($key, &raw)?;
                }
            };
        }

        // Signaling
        set!("MESHFEED_SIGNALING_REQUEST_TIMEOUT", config.signaling.request_timeout, duration);
        set!("MESHFEED_SIGNALING_RECONNECT_BASE", config.signaling.reconnect_base, duration);
        set!("MESHFEED_SIGNALING_RECONNECT_CAP", config.signaling.reconnect_cap, duration);
        set!("MESHFEED_SIGNALING_MAX_RECONNECT_ATTEMPTS", config.signaling.max_reconnect_attempts);

        // Swarm
        set!("MESHFEED_SWARM_TICK_INTERVAL", config.swarm.tick_interval, duration);
        set!("MESHFEED_SWARM_CONNECT_TIMEOUT", config.swarm.connect_timeout, duration);
        set!("MESHFEED_SWARM_RETRY_BASE", config.swarm.retry_base, duration);
        set!("MESHFEED_SWARM_RETRY_CAP", config.swarm.retry_cap, duration);
        set!("MESHFEED_SWARM_MAX_RETRIES", config.swarm.max_retries);
        set!("MESHFEED_SWARM_UNREACHABLE_COOLDOWN", config.swarm.unreachable_cooldown, duration);
        set!("MESHFEED_SWARM_PASSIVE_GRACE", config.swarm.passive_grace, duration);

        // Teleport
        set!("MESHFEED_TELEPORT_INITIAL_CREDIT", config.teleport.initial_credit);
        set!("MESHFEED_TELEPORT_MAX_FRAME_SIZE", config.teleport.max_frame_size);
        set!("MESHFEED_TELEPORT_MAX_MESSAGE_SIZE", config.teleport.max_message_size);

        // Presence
        set!("MESHFEED_PRESENCE_ALIVE_INTERVAL", config.presence.alive_interval, duration);
        set!("MESHFEED_PRESENCE_PEER_TIMEOUT", config.presence.peer_timeout, duration);

        // Replication
        set!("MESHFEED_REPLICATION_GAP_TIMEOUT", config.replication.gap_timeout, duration);
        set!("MESHFEED_REPLICATION_MAX_BUFFERED_PER_FEED", config.replication.max_buffered_per_feed);
        set!("MESHFEED_REPLICATION_HANDSHAKE_TIMEOUT", config.replication.handshake_timeout, duration);
        set!("MESHFEED_REPLICATION_PROGRESS_INTERVAL", config.replication.progress_interval, duration);

        // Logging
        if let Some(level) = lookup("MESHFEED_LOG_LEVEL") {
            config.logging.level = level;
        }
        set!("MESHFEED_LOG_JSON", config.logging.json_format);

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than 0"));
            }
            Ok(())
        }

        positive("signaling.request_timeout", self.signaling.request_timeout)?;
        positive("signaling.reconnect_base", self.signaling.reconnect_base)?;
        if self.signaling.reconnect_cap < self.signaling.reconnect_base {
            return Err(ConfigError::invalid(
                "signaling.reconnect_cap",
                "must not be below reconnect_base",
            ));
        }

        positive("swarm.tick_interval", self.swarm.tick_interval)?;
        positive("swarm.connect_timeout", self.swarm.connect_timeout)?;
        positive("swarm.retry_base", self.swarm.retry_base)?;
        if self.swarm.retry_cap < self.swarm.retry_base {
            return Err(ConfigError::invalid("swarm.retry_cap", "must not be below retry_base"));
        }
        if self.swarm.max_retries == 0 {
            return Err(ConfigError::invalid("swarm.max_retries", "must be greater than 0"));
        }

        if self.teleport.initial_credit == 0 {
            return Err(ConfigError::invalid("teleport.initial_credit", "must be greater than 0"));
        }
        if self.teleport.max_frame_size < self.teleport.initial_credit {
            return Err(ConfigError::invalid(
                "teleport.max_frame_size",
                "must fit a full credit window",
            ));
        }
        if (self.teleport.max_message_size as usize) < MAX_MESSAGE_SIZE {
            return Err(ConfigError::invalid(
                "teleport.max_message_size",
                format!("must carry a full feed entry ({} bytes)", MAX_MESSAGE_SIZE),
            ));
        }

        positive("presence.alive_interval", self.presence.alive_interval)?;
        if self.presence.peer_timeout <= self.presence.alive_interval {
            return Err(ConfigError::invalid(
                "presence.peer_timeout",
                "must be longer than alive_interval",
            ));
        }

        positive("replication.gap_timeout", self.replication.gap_timeout)?;
        positive("replication.handshake_timeout", self.replication.handshake_timeout)?;
        positive("replication.progress_interval", self.replication.progress_interval)?;
        if self.replication.max_buffered_per_feed == 0 {
            return Err(ConfigError::invalid(
                "replication.max_buffered_per_feed",
                "must be greater than 0",
            ));
        }
        if self.replication.event_capacity == 0 {
            return Err(ConfigError::invalid("replication.event_capacity", "must be greater than 0"));
        }

        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("{:?} is not a log level", self.logging.level),
            ));
        }

        Ok(())
    }
}
