//! Utility functions and helper methods for the avatar server.
//!
//! This module provides convenient factory functions for creating server
//! instances with different configurations.

use crate::config::ServerConfig;
use crate::plugins::auth::Authenticator;
use crate::plugins::storage::AvatarStore;
use crate::server::AvatarServer;
use std::sync::Arc;

/// Creates a new avatar server with default configuration.
///
/// # Example
///
/// ```rust
/// use avatar_server::create_server;
/// use avatar_server::plugins::auth::StaticTokenAuthenticator;
/// use avatar_server::plugins::storage::MemoryStore;
/// use std::sync::Arc;
///
/// let auth = StaticTokenAuthenticator::with_tokens([("secret", "alice")]);
/// let server = create_server(Arc::new(auth), Arc::new(MemoryStore::new()));
/// assert_eq!(server.core().registry().len(), 0);
/// ```
pub fn create_server(
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn AvatarStore>,
) -> AvatarServer {
    AvatarServer::new(ServerConfig::default(), authenticator, store)
}

/// Creates a new avatar server with custom configuration.
///
/// # Example
///
/// ```rust
/// use avatar_server::{create_server_with_config, ServerConfig};
/// use avatar_server::plugins::auth::StaticTokenAuthenticator;
/// use avatar_server::plugins::storage::MemoryStore;
/// use std::sync::Arc;
///
/// let config = ServerConfig {
///     bind_address: "0.0.0.0:9000".parse().unwrap(),
///     max_connections: 5000,
///     ..Default::default()
/// };
///
/// let server = create_server_with_config(
///     config,
///     Arc::new(StaticTokenAuthenticator::new()),
///     Arc::new(MemoryStore::new()),
/// );
/// assert_eq!(server.config().max_connections, 5000);
/// ```
pub fn create_server_with_config(
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn AvatarStore>,
) -> AvatarServer {
    AvatarServer::new(config, authenticator, store)
}
