// Tracery Configuration
//
// Defines runtime configuration for the server, storage, pipeline and
// streaming broker, loaded from TOML with env-var overrides at the binary
// boundary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceryConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Initial feature-flag states, consumed by the Gate at startup
    #[serde(default)]
    pub features: FeatureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8600).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file (":memory:" for tests)
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "tracery.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of events consumed per run
    pub batch_size: usize,

    /// Interval between periodic pipeline triggers (in seconds)
    #[serde(with = "serde_duration")]
    pub interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,

    /// Interval between keepalive pings on dashboard streams (in seconds)
    #[serde(with = "serde_duration")]
    pub ping_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ping_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Pattern derivation (the pipeline runner's write path)
    pub learning: bool,

    /// Live streaming (chat tokens, dashboard refresh)
    pub streaming: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            learning: true,
            streaming: true,
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for TraceryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            pipeline: PipelineConfig::default(),
            stream: StreamConfig::default(),
            features: FeatureConfig::default(),
        }
    }
}

impl TraceryConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: TraceryConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 || self.pipeline.batch_size > 1000 {
            return Err(ConfigError::ValidationError(
                "pipeline.batch_size must be between 1 and 1000".to_string(),
            ));
        }

        if self.pipeline.interval < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(
                "pipeline.interval must be at least 1 second".to_string(),
            ));
        }

        if self.stream.queue_capacity == 0 || self.stream.queue_capacity > 4096 {
            return Err(ConfigError::ValidationError(
                "stream.queue_capacity must be between 1 and 4096".to_string(),
            ));
        }

        if self.stream.ping_interval < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(
                "stream.ping_interval must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }
}
