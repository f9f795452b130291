//! Stop signals and Sculptor's two-step shutdown.
//!
//! The first SIGINT or SIGTERM starts a graceful shutdown through the
//! server's [`ShutdownState`]: the accept loops stop and every session is
//! closed with a proper close frame. Any further signal ends the process
//! immediately with exit code 1. Elsewhere than Unix only Ctrl+C is watched.

use avatar_server::ShutdownState;
use std::fmt;
use std::io;
use tracing::{error, info, warn};

/// Signal that asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Registered stop-signal listeners. Signals arriving after [`listen`]
/// returns are buffered until the next [`recv`].
///
/// [`listen`]: StopSignals::listen
/// [`recv`]: StopSignals::recv
pub struct StopSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl StopSignals {
    pub fn listen() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Waits for the next stop signal.
    pub async fn recv(&mut self) -> io::Result<StopSignal> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Ok(StopSignal::Interrupt),
                _ = self.terminate.recv() => Ok(StopSignal::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            Ok(StopSignal::Interrupt)
        }
    }
}

/// Waits for the first stop signal and initiates `shutdown` with it. From
/// then on a second signal exits the process without waiting for sessions.
///
/// # Example
///
/// ```rust,no_run
/// use avatar_server::ShutdownState;
/// use lib_sculptor::signals::shutdown_on_signal;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let shutdown = ShutdownState::new();
///     // Hand `shutdown.clone()` to the server, then:
///     let signal = shutdown_on_signal(&shutdown).await?;
///     println!("stopping after {signal}");
///     Ok(())
/// }
/// ```
pub async fn shutdown_on_signal(shutdown: &ShutdownState) -> io::Result<StopSignal> {
    let mut signals = StopSignals::listen()?;
    let first = signals.recv().await?;
    info!("📡 {} received, closing sessions", first);
    shutdown.initiate_shutdown();

    tokio::spawn(async move {
        match signals.recv().await {
            Ok(second) => {
                warn!("⚡ {} received during shutdown, exiting now", second);
                std::process::exit(1);
            }
            Err(e) => error!("Stopped watching for a forced exit: {}", e),
        }
    });
    Ok(first)
}
