//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that orchestrates server
//! startup, periodic statistics and graceful shutdown.

use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::logging::display_banner;
use crate::signals::shutdown_on_signal;
use avatar_server::plugins::{DirectoryStore, StaticTokenAuthenticator};
use avatar_server::{AvatarServer, SessionCore, ShutdownState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Interval between health reports.
const MONITORING_INTERVAL: Duration = Duration::from_secs(60);

/// Time the server task gets to close every session after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(8);

/// Main application struct.
///
/// The `Application` manages the complete lifecycle of the Sculptor server,
/// including configuration loading, server initialization, health monitoring,
/// and graceful shutdown handling.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Avatar server instance
    server: AvatarServer,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Display startup banner
    /// 5. Build the authenticator, the avatar store and the server
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        apply_overrides(&mut config, args);

        // Validate configuration
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let server_config = config.to_server_config()?;
        let authenticator = StaticTokenAuthenticator::with_tokens(config.auth.tokens.clone());
        if authenticator.is_empty() {
            warn!("⚠️ No auth tokens configured - every handshake will be rejected");
        }
        let store = DirectoryStore::new(config.storage_root());
        let server = AvatarServer::new(server_config, Arc::new(authenticator), Arc::new(store));

        Ok(Self { config, server })
    }

    /// Runs the application until a shutdown signal arrives.
    ///
    /// # Monitoring Features
    ///
    /// * **Configuration Summary**: Displays key settings at startup
    /// * **Periodic Health Reports**: Session, delivery and cache statistics every 60 seconds
    /// * **Final Statistics**: Summary report during shutdown
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Sculptor");
        self.log_configuration_summary();

        let core = Arc::clone(self.server.core());
        let shutdown_state = ShutdownState::new();

        // Start server in background
        let server_handle = {
            let server = self.server;
            let shutdown_state = shutdown_state.clone();
            tokio::spawn(async move {
                match server.start_with_shutdown_state(shutdown_state).await {
                    Ok(()) => info!("✅ Server completed successfully"),
                    Err(e) => {
                        error!("❌ Server error: {:?}", e);
                        std::process::exit(1);
                    }
                }
            })
        };

        // Start monitoring task for real-time statistics
        let monitoring_handle = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MONITORING_INTERVAL);
                interval.tick().await;
                let mut last_deliveries = 0u64;

                loop {
                    interval.tick().await;
                    let stats = core.stats().snapshot();
                    let cache = core.cache().stats();
                    let deliveries_this_period = stats.deliveries - last_deliveries;
                    last_deliveries = stats.deliveries;

                    info!(
                        "📊 System Health - {} sessions | {} deliveries/min | cache {} entries, {} bytes, {} hits / {} misses",
                        core.registry().len(),
                        deliveries_this_period,
                        cache.entries,
                        cache.resident_bytes,
                        cache.hits,
                        cache.misses
                    );
                    if stats.dropped_messages > 0 {
                        warn!(
                            "🐌 {} outbound message(s) dropped so far",
                            stats.dropped_messages
                        );
                    }
                }
            })
        };

        info!("✅ Sculptor is now running!");
        info!("🎮 Ready to accept connections on {}", self.config.server.bind_address);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        // First signal drains sessions, a second one exits at once
        let signal = shutdown_on_signal(&shutdown_state).await?;
        info!("🛑 Graceful shutdown after {}...", signal);
        monitoring_handle.abort();

        match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
            Ok(Ok(())) => info!("✅ Server task completed gracefully"),
            Ok(Err(e)) => error!("❌ Server task failed: {}", e),
            Err(_) => warn!("⏰ Server task did not complete within timeout, proceeding with cleanup"),
        }

        log_final_statistics(&core).await;
        info!("👋 Sculptor shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        match &self.config.server.feed_address {
            Some(feed) => info!("  📡 Collaborator feed: {}", feed),
            None => info!("  📡 Collaborator feed: disabled"),
        }
        info!("  📂 Avatar storage: {}", self.config.storage.directory);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  ⏱️ Connection timeout: {}s", self.config.server.connection_timeout);
        info!(
            "  📦 Cache budget: {} MB | Frame size: {} KB | Queue: {} messages",
            self.config.cache.byte_budget / (1024 * 1024),
            self.config.distribution.max_frame_size / 1024,
            self.config.distribution.outbound_queue_capacity
        );
    }
}

fn apply_overrides(config: &mut AppConfig, args: CliArgs) {
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }
    if let Some(feed_address) = args.feed_address {
        config.server.feed_address = Some(feed_address);
    }
    if let Some(avatar_dir) = args.avatar_dir {
        config.storage.directory = avatar_dir.to_string_lossy().to_string();
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

/// Logs final statistics during shutdown.
async fn log_final_statistics(core: &SessionCore) {
    let stats = core.stats().snapshot();
    let cache = core.cache().stats();
    let security = core.security().get_stats().await;
    info!("📊 Final Statistics:");
    info!("  - Uptime: {}s", stats.uptime_secs);
    info!(
        "  - Sessions admitted/closed: {}/{}",
        stats.sessions_admitted, stats.sessions_closed
    );
    info!(
        "  - Connections accepted/refused: {}/{}",
        stats.connections_accepted, stats.connections_refused
    );
    info!("  - Auth rejections: {}", stats.auth_rejections);
    info!(
        "  - Deliveries: {} ({} failed)",
        stats.deliveries, stats.delivery_failures
    );
    info!(
        "  - Frames sent: {} ({} bytes)",
        stats.frames_sent, stats.bytes_sent
    );
    info!(
        "  - Pings relayed: {} ({} rate limited)",
        stats.pings_relayed, security.rate_limited_pings
    );
    info!(
        "  - Cache: {} fetches, {} evictions",
        cache.fetches, cache.evictions
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn args(config_path: PathBuf) -> CliArgs {
        CliArgs {
            config_path,
            bind_address: None,
            feed_address: None,
            avatar_dir: None,
            log_level: None,
            json_logs: false,
        }
    }

    #[test]
    fn cli_overrides_config_file() {
        let mut config = AppConfig::default();
        let mut cli = args(PathBuf::from("unused.toml"));
        cli.bind_address = Some("0.0.0.0:9000".to_string());
        cli.avatar_dir = Some(PathBuf::from("/srv/avatars"));
        cli.log_level = Some("debug".to_string());
        cli.json_logs = true;

        apply_overrides(&mut config, cli);
        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert_eq!(config.storage.directory, "/srv/avatars");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.server.feed_address.as_deref(), Some("127.0.0.1:6666"));
    }

    #[tokio::test]
    async fn application_builds_from_generated_config() {
        let dir = TempDir::new().unwrap();
        let app = Application::new(args(dir.path().join("config.toml")))
            .await
            .unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert!(app.server.core().registry().is_empty());
    }

    #[tokio::test]
    async fn application_rejects_invalid_overrides() {
        let dir = TempDir::new().unwrap();
        let mut cli = args(dir.path().join("config.toml"));
        cli.log_level = Some("chatty".to_string());
        assert!(Application::new(cli).await.is_err());
    }
}
