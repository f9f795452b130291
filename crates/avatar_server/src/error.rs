//! Error types and handling for the avatar server.
//!
//! Errors are grouped by the component that raises them. None of the
//! per-session errors is fatal to the process: the session core converts each
//! of them into that session's `Closing` transition.

use crate::session::ConnectionState;
use crate::types::{AvatarKey, PlayerIdentity, SessionId};

/// Enumeration of possible server errors.
///
/// Categorizes errors into network-related and internal server errors
/// to help with debugging and error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures or connection issues
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while resolving avatar payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AvatarError {
    /// The storage plugin has no such avatar (or it was removed). The viewer
    /// simply is not shown it.
    #[error("avatar {0} not found")]
    NotFound(AvatarKey),

    /// Transient storage failure. Never cached; the next access retries.
    #[error("avatar storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Failures in the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Terminal for the connection attempt; the client must retry with a fresh token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The identity already holds an active session and the registry is
    /// configured to reject newcomers.
    #[error("identity {0} already has an active session")]
    DuplicateSession(PlayerIdentity),

    /// The identity is on the ban list.
    #[error("identity {0} is banned")]
    Banned(PlayerIdentity),

    /// Send or queue failure isolated to one session.
    #[error("connection failure on session {session}: {reason}")]
    ConnectionFailure { session: SessionId, reason: String },

    /// A lifecycle transition that would skip or revisit a state.
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Failures of a single avatar delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Avatar(#[from] AvatarError),

    #[error(transparent)]
    Connection(#[from] SessionError),

    /// The viewer's outbound queue was full and the overflow policy dropped the delivery.
    #[error("outbound queue of session {0} is full")]
    QueueFull(SessionId),

    /// Viewer or target closed while the delivery was in flight.
    #[error("delivery cancelled")]
    Cancelled,
}
