//! Log output for Sculptor.
//!
//! Logs go through `tracing`. The subscriber writes either compact lines for
//! operators at a terminal or one JSON object per event for log shippers.
//! `RUST_LOG` always takes precedence over the configured level.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shape of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact, colored single-line events.
    Compact,
    /// One flattened JSON object per event.
    Json,
}

impl LogFormat {
    /// `--json-logs` forces JSON; otherwise the config file decides.
    pub fn select(settings: &LoggingSettings, force_json: bool) -> Self {
        if force_json || settings.json_format {
            Self::Json
        } else {
            Self::Compact
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn setup_logging(
    settings: &LoggingSettings,
    force_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = LogFormat::select(settings, force_json);
    let events = fmt::layer().with_thread_names(true).with_target(true);
    let subscriber = tracing_subscriber::registry().with(env_filter(&settings.level));

    match format {
        LogFormat::Json => subscriber
            .with(events.json().flatten_event(true).with_current_span(false))
            .try_init()?,
        LogFormat::Compact => subscriber.with(events.compact()).try_init()?,
    }

    info!("🔧 Logging at {} ({:?})", settings.level, format);
    Ok(())
}

/// Logs the startup banner.
pub fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("🗿 Sculptor v{} - avatar distribution server", version);
    info!("   🎭 proximity-driven delivery | 📦 byte-bounded cache | 🌐 binary WebSocket");
}
