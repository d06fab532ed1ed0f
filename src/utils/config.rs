//! Configuration management for peerway.
//!
//! TOML-based configuration with defaults, an optional file and `PEERWAY_*`
//! environment overrides, validated before use.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "peerway.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "PEERWAY";

/// Complete configuration for a peerway node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerwayConfig {
    /// Signaling relay configuration
    pub relay: RelayConfig,
    /// Direct transport configuration
    pub network: NetworkConfig,
    /// Synchronization defaults
    pub sync: SyncSettings,
    /// Storage locations
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay address clients connect to (`host:port`)
    pub address: String,
    /// Address the relay server listens on
    pub listen: SocketAddr,
    /// Seconds to wait for a relay response (resolve, list, setup)
    pub request_timeout: u64,
}

/// Direct transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local address transports bind to
    pub bind_address: IpAddr,
    /// Largest single transport frame in bytes
    pub max_frame_size: usize,
    /// Largest chunked transfer a channel accepts, in bytes
    pub max_transfer_size: usize,
    /// Seconds to wait for a `data.ack` after a transfer
    pub ack_timeout: u64,
    /// Seconds to wait for a `cert.present` reply
    pub verify_timeout: u64,
    /// Seconds a negotiation may stay in `Connecting`
    pub connect_timeout: u64,
}

/// Synchronization defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Posts kept per remote author
    pub cache_post_limit_per_user: usize,
    /// Subscribe to the peer's posts when syncing
    pub subscribe: bool,
    /// Run a sync round when an outbound connection is established
    pub sync_on_connect: bool,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for the entity key material
    pub keys_dir: PathBuf,
    /// Root of the transferred file store
    pub files_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", crate::defaults::DEFAULT_RELAY_PORT),
            listen: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                crate::defaults::DEFAULT_RELAY_PORT,
            ),
            request_timeout: crate::defaults::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_frame_size: crate::defaults::DEFAULT_MAX_FRAME_SIZE,
            max_transfer_size: 64 * 1024 * 1024, // 64MB
            ack_timeout: 30,
            verify_timeout: 30,
            connect_timeout: 20,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_post_limit_per_user: crate::defaults::DEFAULT_CACHE_POST_LIMIT,
            subscribe: true,
            sync_on_connect: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerway");

        Self::under(data_dir)
    }
}

impl StorageConfig {
    /// Storage layout rooted at `data_dir`
    pub fn under(data_dir: PathBuf) -> Self {
        Self {
            keys_dir: data_dir.join("keys"),
            files_dir: data_dir.join("files"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Relay request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl NetworkConfig {
    /// Transfer acknowledgement timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    /// Certificate verification timeout as a duration
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout)
    }

    /// Negotiation timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl PeerwayConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("peerway")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Apply `PEERWAY_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(address) = std::env::var(format!("{ENV_PREFIX}_RELAY_ADDRESS")) {
            self.relay.address = address;
        }

        if let Ok(listen) = std::env::var(format!("{ENV_PREFIX}_RELAY_LISTEN")) {
            self.relay.listen = listen.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_RELAY_LISTEN"),
                value: listen,
            })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage = StorageConfig::under(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, value: impl ToString) -> crate::utils::PeerwayError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
            .into()
        }

        if self.relay.address.is_empty() {
            return Err(invalid("relay.address", ""));
        }
        if self.relay.request_timeout == 0 {
            return Err(invalid("relay.request_timeout", 0));
        }
        if self.network.max_frame_size < 1024 {
            return Err(invalid("network.max_frame_size", self.network.max_frame_size));
        }
        if self.network.max_transfer_size < self.network.max_frame_size {
            return Err(invalid(
                "network.max_transfer_size",
                self.network.max_transfer_size,
            ));
        }
        if self.network.connect_timeout == 0 {
            return Err(invalid("network.connect_timeout", 0));
        }
        if self.sync.cache_post_limit_per_user == 0 {
            return Err(invalid("sync.cache_post_limit_per_user", 0));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.keys_dir,
            &self.storage.files_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PeerwayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.listen.port(), crate::defaults::DEFAULT_RELAY_PORT);
        assert_eq!(
            config.network.max_frame_size,
            crate::defaults::DEFAULT_MAX_FRAME_SIZE
        );
        assert!(config.sync.sync_on_connect);
    }

    #[test]
    fn test_config_serialization() {
        let config = PeerwayConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("max_frame_size"));
        assert!(toml_str.contains("cache_post_limit_per_user"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = PeerwayConfig::default();
        config.relay.address = "relay.example:7001".to_string();
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = PeerwayConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.relay.address, "relay.example:7001");
        assert_eq!(
            loaded.sync.cache_post_limit_per_user,
            config.sync.cache_post_limit_per_user
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = PeerwayConfig::default();
        config.network.max_frame_size = 10;
        assert!(config.validate().is_err());

        config = PeerwayConfig::default();
        config.sync.cache_post_limit_per_user = 0;
        assert!(config.validate().is_err());

        config = PeerwayConfig::default();
        config.network.connect_timeout = 0;
        assert!(config.validate().is_err());

        config = PeerwayConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PEERWAY_RELAY_ADDRESS", "10.0.0.1:9999");

        let config = PeerwayConfig::default().merge_from_env().unwrap();
        assert_eq!(config.relay.address, "10.0.0.1:9999");

        std::env::remove_var("PEERWAY_RELAY_ADDRESS");
    }

    #[test]
    fn test_directory_paths() {
        let config = PeerwayConfig::default();
        assert!(config.storage.keys_dir.starts_with(&config.storage.data_dir));
        assert!(config.storage.files_dir.starts_with(&config.storage.data_dir));
    }
}
