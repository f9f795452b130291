//! Security module for ban enforcement, connection caps and ping limits.

use crate::config::SecurityConfig;
use crate::types::{PlayerIdentity, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod rate_limiter;

pub use rate_limiter::RateLimiter;

/// Central security manager for the avatar server
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    ping_limiter: RateLimiter<SessionId>,
    banned: Arc<RwLock<HashSet<PlayerIdentity>>>,
    connection_tracker: Arc<RwLock<HashMap<IpAddr, u32>>>,
}

impl SecurityManager {
    /// Creates a new security manager with the given configuration
    pub fn new(config: SecurityConfig) -> Self {
        let banned = config.banned_identities.iter().cloned().collect();
        Self {
            ping_limiter: RateLimiter::per_second(config.ping_rate),
            banned: Arc::new(RwLock::new(banned)),
            connection_tracker: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Counts a new connection from `ip`, refusing it above the per-IP cap.
    pub async fn validate_connection(&self, ip: IpAddr) -> Result<(), SecurityError> {
        let mut tracker = self.connection_tracker.write().await;
        let count = tracker.entry(ip).or_insert(0);

        if *count >= self.config.max_connections_per_ip {
            return Err(SecurityError::TooManyConnections(ip));
        }

        *count += 1;
        Ok(())
    }

    /// Registers a connection disconnect
    pub async fn on_disconnect(&self, ip: IpAddr) {
        let mut tracker = self.connection_tracker.write().await;
        if let Some(count) = tracker.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tracker.remove(&ip);
            }
        }
    }

    /// Validates the size of a raw client message
    pub fn validate_message_size(&self, len: usize) -> Result<(), SecurityError> {
        if len > self.config.max_message_size {
            return Err(SecurityError::MessageTooLarge(len));
        }
        Ok(())
    }

    /// Validates a ping before it is relayed to the sender's viewers.
    pub async fn validate_ping(&self, session: SessionId, size: usize) -> Result<(), SecurityError> {
        if size > self.config.max_ping_size {
            return Err(SecurityError::PingTooLarge(size));
        }

        if self.config.enable_rate_limiting && !self.ping_limiter.check_rate_limit(session).await {
            return Err(SecurityError::RateLimitExceeded(session));
        }

        Ok(())
    }

    /// Releases per-session state once a session is gone.
    pub async fn on_session_closed(&self, session: SessionId) {
        self.ping_limiter.forget(&session).await;
    }

    pub async fn is_banned(&self, identity: &PlayerIdentity) -> bool {
        self.banned.read().await.contains(identity)
    }

    /// Adds an identity to the ban list. Returns false if it was already banned.
    pub async fn ban(&self, identity: PlayerIdentity) -> bool {
        self.banned.write().await.insert(identity)
    }

    /// Lifts a ban. Returns false if the identity was not banned.
    pub async fn unban(&self, identity: &PlayerIdentity) -> bool {
        self.banned.write().await.remove(identity)
    }

    /// Gets current security statistics
    pub async fn get_stats(&self) -> SecurityStats {
        SecurityStats {
            tracked_ips: self.connection_tracker.read().await.len(),
            rate_limited_pings: self.ping_limiter.blocked_count(),
            banned_identities: self.banned.read().await.len(),
        }
    }
}

/// Security-related statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStats {
    pub tracked_ips: usize,
    pub rate_limited_pings: u64,
    pub banned_identities: usize,
}

/// Security-related errors
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Too many connections from IP {0}")]
    TooManyConnections(IpAddr),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Ping too large: {0} bytes")]
    PingTooLarge(usize),

    #[error("Ping rate limit exceeded for session {0}")]
    RateLimitExceeded(SessionId),
}
