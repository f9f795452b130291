//! Configuration management for the Sculptor server.
//!
//! This module handles loading, validation, and conversion of server configuration
//! from TOML files and command-line arguments.

use avatar_server::config::{CacheConfig, DistributionConfig, DuplicatePolicy, SecurityConfig};
use avatar_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Application configuration loaded from TOML file.
///
/// Sections missing from the file fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration settings
    pub server: ServerSettings,
    /// Avatar cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Avatar delivery settings
    #[serde(default)]
    pub distribution: DistributionConfig,
    /// Ban list, connection caps and ping limits
    #[serde(default)]
    pub security: SecurityConfig,
    /// Accepted handshake tokens
    #[serde(default)]
    pub auth: AuthSettings,
    /// Avatar storage location
    #[serde(default)]
    pub storage: StorageSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
///
/// Controls network binding, connection limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address client WebSockets connect to (e.g., "127.0.0.1:6665")
    pub bind_address: String,
    /// Address of the collaborator feed; omit to disable it
    #[serde(default)]
    pub feed_address: Option<String>,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds a client has to send its handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// What to do when an identity logs in twice
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: DuplicatePolicy,
}

pub fn default_connection_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_duplicate_policy() -> DuplicatePolicy {
    DuplicatePolicy::EvictOld
}

/// Token table for the bundled static authenticator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Token to player identity
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

/// Avatar storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory holding `<identity>/<version>.moon` files
    pub directory: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: "avatars".to_string(),
        }
    }
}

/// Logging system configuration.
///
/// Controls log output format, levels, and destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            server: ServerSettings {
                bind_address: server.bind_address.to_string(),
                feed_address: server.feed_address.map(|address| address.to_string()),
                max_connections: server.max_connections,
                connection_timeout: server.connection_timeout,
                handshake_timeout: server.handshake_timeout,
                duplicate_policy: server.duplicate_policy,
            },
            cache: server.cache,
            distribution: server.distribution,
            security: server.security,
            auth: AuthSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written to
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config file
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the application configuration into the server's own.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let bind_address: SocketAddr = self.server.bind_address.parse()?;
        let feed_address = match &self.server.feed_address {
            Some(address) => Some(address.parse::<SocketAddr>()?),
            None => None,
        };

        Ok(ServerConfig {
            bind_address,
            feed_address,
            max_connections: self.server.max_connections,
            connection_timeout: self.server.connection_timeout,
            handshake_timeout: self.server.handshake_timeout,
            duplicate_policy: self.server.duplicate_policy,
            cache: self.cache.clone(),
            distribution: self.distribution.clone(),
            security: self.security.clone(),
        })
    }

    /// Directory the avatar store reads from.
    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.directory)
    }

    /// Validates the configuration settings.
    pub fn validate(&self) -> Result<(), String> {
        // Validate addresses
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }
        if let Some(feed) = &self.server.feed_address {
            if feed.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid feed address: {feed}"));
            }
            if *feed == self.server.bind_address {
                return Err("Feed address must differ from bind address".to_string());
            }
        }

        if self.server.max_connections == 0 {
            return Err("server.max_connections must be greater than 0".to_string());
        }
        if self.server.connection_timeout == 0 || self.server.handshake_timeout == 0 {
            return Err("Timeouts must be greater than 0".to_string());
        }

        if self.cache.byte_budget == 0 {
            return Err("cache.byte_budget must be greater than 0".to_string());
        }
        if self.distribution.max_frame_size == 0 {
            return Err("distribution.max_frame_size must be greater than 0".to_string());
        }
        if self.distribution.outbound_queue_capacity == 0 {
            return Err(
                "distribution.outbound_queue_capacity must be greater than 0".to_string(),
            );
        }

        if self.security.ping_rate == 0 {
            return Err("security.ping_rate must be greater than 0".to_string());
        }
        if self.security.max_ping_size >= self.security.max_message_size {
            return Err(
                "security.max_ping_size must be smaller than security.max_message_size"
                    .to_string(),
            );
        }

        if self.storage.directory.is_empty() {
            return Err("Storage directory cannot be empty".to_string());
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
