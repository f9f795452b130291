use crate::error::SessionError;
use crate::protocol::close_codes;
use std::fmt;

/// Connection lifecycle.
///
/// `Connecting → Authenticating → Active → Closing → Closed`. A connection
/// that drops before its handshake goes straight from `Connecting` to
/// `Closing`; nothing ever returns to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closing)
                | (Authenticating, Active)
                | (Authenticating, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Tracks the state of one connection and enforces legal transitions.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Closing` unless the connection is already closing or closed.
    pub fn begin_close(&mut self) -> bool {
        self.advance(ConnectionState::Closing).is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a session (or a connection that never became one) was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket or it dropped.
    ClientClosed,
    Logout,
    /// A newer login for the same identity took over.
    Replaced,
    Kicked(String),
    Banned,
    AuthRejected,
    HandshakeTimeout,
    IdleTimeout,
    /// The outbound queue overflowed under the disconnect policy.
    SlowConsumer,
    ProtocolViolation(String),
    ConnectionFailure(String),
    ServerShutdown,
}

impl CloseReason {
    /// Close frame code and reason text sent to the client.
    pub fn close_frame(&self) -> (u16, String) {
        match self {
            Self::ClientClosed => (1000, String::new()),
            Self::Logout => (1000, "logged out".to_string()),
            Self::Replaced => (
                close_codes::REPLACED,
                "logged in from another location".to_string(),
            ),
            Self::Kicked(reason) => (1000, reason.clone()),
            Self::Banned => (close_codes::BANNED, "banned".to_string()),
            Self::AuthRejected => (close_codes::RE_AUTH, "re-auth".to_string()),
            Self::HandshakeTimeout => (close_codes::RE_AUTH, "handshake timeout".to_string()),
            Self::IdleTimeout => (1000, "idle timeout".to_string()),
            Self::SlowConsumer => (close_codes::POLICY_VIOLATION, "slow consumer".to_string()),
            Self::ProtocolViolation(reason) => (close_codes::POLICY_VIOLATION, reason.clone()),
            Self::ConnectionFailure(reason) => (1011, reason.clone()),
            Self::ServerShutdown => (1001, "server shutting down".to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::Logout => f.write_str("logout"),
            Self::Replaced => f.write_str("replaced by newer session"),
            Self::Kicked(reason) => write!(f, "kicked: {reason}"),
            Self::Banned => f.write_str("banned"),
            Self::AuthRejected => f.write_str("authentication rejected"),
            Self::HandshakeTimeout => f.write_str("handshake timeout"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::SlowConsumer => f.write_str("slow consumer"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::ConnectionFailure(reason) => write!(f, "connection failure: {reason}"),
            Self::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_visits_every_state() {
        let mut lifecycle = Lifecycle::new();
        for next in [Authenticating, Active, Closing, Closed] {
            lifecycle.advance(next).unwrap();
        }
        assert_eq!(lifecycle.state(), Closed);
    }

    #[test]
    fn auth_rejection_goes_to_closing() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Authenticating).unwrap();
        assert!(lifecycle.begin_close());
        assert!(!lifecycle.begin_close());
        assert_eq!(lifecycle.state(), Closing);
    }

    #[test]
    fn no_skips_and_no_reentry() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(
            lifecycle.advance(Active),
            Err(SessionError::InvalidTransition {
                from: Connecting,
                to: Active
            })
        );

        for next in [Authenticating, Active, Closing] {
            lifecycle.advance(next).unwrap();
        }
        assert!(lifecycle.advance(Active).is_err());
        assert!(lifecycle.advance(Authenticating).is_err());
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Active.can_transition_to(Closed));
    }

    #[test]
    fn close_codes_follow_reason() {
        assert_eq!(CloseReason::AuthRejected.close_frame().0, 4000);
        assert_eq!(CloseReason::Banned.close_frame().0, 4001);
        assert_eq!(CloseReason::Replaced.close_frame().0, 4002);
        assert_eq!(CloseReason::SlowConsumer.close_frame().0, 4003);
    }
}
