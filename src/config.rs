//! Backend configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default configuration constants
pub mod defaults {
    /// Default listen address for the backend CM listener.
    pub const fn listen_addr() -> &'static str {
        "0.0.0.0:4420"
    }

    /// Default number of control session slots.
    pub const MAX_CLIENTS: u32 = 32;

    /// Default number of buffer session slots.
    pub const MAX_BUFFS: u32 = 32;

    /// Default metadata cache sizing: 2^16 buckets.
    pub const CACHE_BUCKET_POWER: u32 = 16;

    /// Default storage quota reported through the free-space query: 1 TiB.
    pub const QUOTA_BYTES: u64 = 1 << 40;

    /// Default log level
    pub const fn log_level() -> &'static str {
        "info"
    }
}

/// How the backend notifies the host that responses landed.
///
/// `Polling` leaves the transmit-tail update as a plain RDMA write the
/// host polls for; `Interrupt` uses write-with-immediate so the host can
/// block on a receive completion instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMethod {
    Polling,
    Interrupt,
}

impl Default for NotificationMethod {
    fn default() -> Self {
        NotificationMethod::Polling
    }
}

/// Backend service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Core to pin the polling thread to (unpinned if absent)
    #[serde(default)]
    pub core_id: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "backend1".to_string(),
            log_level: default_log_level(),
            core_id: None,
        }
    }
}

fn default_log_level() -> String {
    defaults::log_level().to_string()
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the CM listener binds (IP:port)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Control session slots
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,

    /// Buffer session slots
    #[serde(default = "default_max_buffs")]
    pub max_buffs: u32,

    /// Completion notification method for the response ring
    #[serde(default)]
    pub completion_notification: NotificationMethod,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_clients: defaults::MAX_CLIENTS,
            max_buffs: defaults::MAX_BUFFS,
            completion_notification: NotificationMethod::default(),
        }
    }
}

fn default_listen_addr() -> String {
    defaults::listen_addr().to_string()
}

fn default_max_clients() -> u32 {
    defaults::MAX_CLIENTS
}

fn default_max_buffs() -> u32 {
    defaults::MAX_BUFFS
}

/// Metadata cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// log2 of the bucket count
    #[serde(default = "default_bucket_power")]
    pub bucket_count_power: u32,

    /// Optional file of packed items to preload at startup
    #[serde(default)]
    pub preload_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket_count_power: defaults::CACHE_BUCKET_POWER,
            preload_path: None,
        }
    }
}

fn default_bucket_power() -> u32 {
    defaults::CACHE_BUCKET_POWER
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Quota reported through the free-space query
    #[serde(default = "default_quota")]
    pub quota_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: defaults::QUOTA_BYTES,
        }
    }
}

fn default_quota() -> u64 {
    defaults::QUOTA_BYTES
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("failed to read config file: {e}")))?;

        let config: BackendConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::Write(format!("failed to write config file: {e}")))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.is_empty() {
            return Err(ConfigError::Validation("node id cannot be empty".into()));
        }

        if self.network.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "listen address cannot be empty".into(),
            ));
        }

        if self.network.max_clients == 0 || self.network.max_buffs == 0 {
            return Err(ConfigError::Validation(
                "session slot counts must be non-zero".into(),
            ));
        }

        if self.cache.bucket_count_power == 0 || self.cache.bucket_count_power > 28 {
            return Err(ConfigError::Validation(format!(
                "cache bucket power {} out of range 1..=28",
                self.cache.bucket_count_power
            )));
        }

        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "invalid log level: {other}"
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("failed to write config: {0}")]
    Write(String),

    #[error("configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackendConfig::default();
        assert_eq!(config.network.max_clients, defaults::MAX_CLIENTS);
        assert_eq!(
            config.network.completion_notification,
            NotificationMethod::Polling
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BackendConfig::default();

        config.node.node_id = String::new();
        assert!(config.validate().is_err());
        config.node.node_id = "backend1".to_string();

        config.network.max_clients = 0;
        assert!(config.validate().is_err());
        config.network.max_clients = 4;

        config.cache.bucket_count_power = 40;
        assert!(config.validate().is_err());
        config.cache.bucket_count_power = 16;

        config.node.log_level = "noisy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = BackendConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: BackendConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.node.node_id, deserialized.node.node_id);
        assert_eq!(config.network.listen_addr, deserialized.network.listen_addr);
        assert_eq!(
            config.cache.bucket_count_power,
            deserialized.cache.bucket_count_power
        );
    }
}
