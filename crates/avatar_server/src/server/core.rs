//! Core avatar server implementation.
//!
//! This module contains the `AvatarServer` struct, which binds the client and
//! feed listeners, runs the accept loop and drives graceful shutdown of the
//! [`SessionCore`].

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::plugins::auth::Authenticator;
use crate::plugins::storage::AvatarStore;
use crate::server::coordinator::SessionCore;
use crate::server::feed::serve_feed;
use crate::server::handlers::handle_connection;
use crate::shutdown::ShutdownState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// The avatar distribution server.
///
/// `AvatarServer` owns the [`SessionCore`] and the network surface around it:
/// the WebSocket listener clients connect to and the optional collaborator
/// feed. The core can be reached through [`AvatarServer::core`] to inject
/// proximity and storage events in-process.
pub struct AvatarServer {
    config: ServerConfig,
    core: Arc<SessionCore>,
}

impl AvatarServer {
    /// Creates a new avatar server.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    /// * `authenticator` - Verifies handshake tokens
    /// * `store` - Avatar storage backend
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn AvatarStore>,
    ) -> Self {
        let core = SessionCore::new(config.clone(), authenticator, store);
        Self { config, core }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured addresses and serves until shutdown is initiated.
    ///
    /// # Startup Sequence
    ///
    /// 1. Bind the client listener
    /// 2. Bind the collaborator feed, when configured
    /// 3. Start the core's background loops
    /// 4. Accept connections until shutdown, then close every session
    pub async fn start_with_shutdown_state(
        &self,
        shutdown_state: ShutdownState,
    ) -> Result<(), ServerError> {
        let listener = bind(self.config.bind_address).await?;
        let feed_listener = match self.config.feed_address {
            Some(address) => Some(bind(address).await?),
            None => None,
        };
        self.serve(listener, feed_listener, shutdown_state).await
    }

    /// Serves on already bound listeners. Tests bind to port 0 and use this.
    pub async fn serve(
        &self,
        listener: TcpListener,
        feed_listener: Option<TcpListener>,
        shutdown_state: ShutdownState,
    ) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("listener has no address: {e}")))?;
        info!("🚀 Starting avatar server on {}", local);

        let background = self.core.spawn_background(shutdown_state.clone());
        let feed_task = feed_listener.map(|feed_listener| {
            tokio::spawn(serve_feed(
                feed_listener,
                Arc::clone(&self.core),
                shutdown_state.clone(),
            ))
        });

        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        loop {
            let accepted = tokio::select! {
                _ = shutdown_state.wait() => {
                    info!("🛑 Accept loop stopping - shutdown initiated");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                self.core.stats().record_connection_refused();
                warn!(
                    "🚫 Connection limit of {} reached, refusing {}",
                    self.config.max_connections, addr
                );
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
            }
            let core = Arc::clone(&self.core);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, core).await {
                    debug!("Connection error from {}: {}", addr, e);
                }
                drop(permit);
            });
        }

        // Server shutdown cleanup
        info!("🧹 Performing server cleanup...");
        let closed = self.core.shutdown_sessions().await;
        info!("👋 Closed {} session(s)", closed);

        if let Some(feed_task) = feed_task {
            match feed_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Collaborator feed failed: {}", e),
                Err(e) => error!("Collaborator feed task panicked: {}", e),
            }
        }
        for task in background {
            if let Err(e) = task.await {
                error!("Background task panicked: {}", e);
            }
        }

        shutdown_state.complete_shutdown();
        info!("✅ Server cleanup completed");
        Ok(())
    }
}

async fn bind(address: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|e| ServerError::Network(format!("Failed to bind {address}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::auth::StaticTokenAuthenticator;
    use crate::plugins::storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let server = AvatarServer::new(
            ServerConfig::default(),
            Arc::new(StaticTokenAuthenticator::new()),
            Arc::new(MemoryStore::new()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = ShutdownState::new();

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.initiate_shutdown();
        });

        tokio::time::timeout(Duration::from_secs(5), server.serve(listener, None, shutdown.clone()))
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_shutdown_complete());
    }

    #[tokio::test]
    async fn bind_reports_network_errors() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap();
        assert!(matches!(bind(address).await, Err(ServerError::Network(_))));
    }
}
