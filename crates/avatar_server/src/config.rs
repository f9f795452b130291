//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the avatar server behavior.

use crate::types::PlayerIdentity;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the avatar server.
///
/// Contains all parameters for networking, the avatar cache, the
/// distribution engine and the security layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The socket address client WebSockets connect to
    pub bind_address: SocketAddr,

    /// Address of the collaborator feed (proximity and storage notifications).
    /// `None` disables the TCP feed; events can still be injected in-process.
    pub feed_address: Option<SocketAddr>,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Idle timeout in seconds; any client message resets it
    pub connection_timeout: u64,

    /// Seconds a new connection may take to send its handshake
    pub handshake_timeout: u64,

    /// What to do when an identity connects twice
    pub duplicate_policy: DuplicatePolicy,

    /// Avatar cache settings
    pub cache: CacheConfig,

    /// Distribution engine settings
    pub distribution: DistributionConfig,

    /// Security configuration settings
    pub security: SecurityConfig,
}

/// Resolution of a second login by an identity that is already connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Close the old session and admit the new one (reconnect over a flaky network).
    EvictOld,
    /// Keep the old session and refuse the new one.
    RejectNew,
}

/// Behavior when a viewer's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Treat the slow consumer as a broken connection and close it.
    Disconnect,
    /// Drop the message that did not fit and keep the connection.
    DropNewest,
}

/// Avatar cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound of resident payload bytes before LRU eviction kicks in
    pub byte_budget: usize,
}

/// Distribution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Maximum payload bytes carried by one avatar chunk frame
    pub max_frame_size: usize,
    /// Capacity of each connection's outbound queue, in messages
    pub outbound_queue_capacity: usize,
    /// What happens when that queue is full
    pub overflow_policy: OverflowPolicy,
    /// Re-delivery attempts after the avatar store was unavailable
    pub retry_attempts: u32,
    /// Delay before the first re-delivery, doubled on every further attempt
    pub retry_base_delay_ms: u64,
}

impl DistributionConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Security configuration for input validation and protection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable ping rate limiting
    pub enable_rate_limiting: bool,

    /// Maximum relayed pings per second per session
    pub ping_rate: u32,

    /// Maximum ping payload size in bytes
    pub max_ping_size: usize,

    /// Maximum client message size in bytes
    pub max_message_size: usize,

    /// Maximum concurrent connections per IP
    pub max_connections_per_ip: u32,

    /// Identities refused after authentication
    pub banned_identities: Vec<PlayerIdentity>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 6665)),
            feed_address: Some(SocketAddr::from(([127, 0, 0, 1], 6666))),
            max_connections: 1000,
            connection_timeout: 60,
            handshake_timeout: 10,
            duplicate_policy: DuplicatePolicy::EvictOld,
            cache: CacheConfig::default(),
            distribution: DistributionConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_budget: 256 * 1024 * 1024, // 256MB
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024, // 64KB
            outbound_queue_capacity: 256,
            overflow_policy: OverflowPolicy::Disconnect,
            retry_attempts: 5,
            retry_base_delay_ms: 250,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            ping_rate: 32,
            max_ping_size: 1024,
            max_message_size: 64 * 1024, // 64KB
            max_connections_per_ip: 10,
            banned_identities: Vec::new(),
        }
    }
}
