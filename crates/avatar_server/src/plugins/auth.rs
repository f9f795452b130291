//! Authentication collaborator boundary.

use crate::types::PlayerIdentity;
use async_trait::async_trait;
use dashmap::DashMap;

/// Failure reported by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token is unknown, expired or otherwise invalid.
    #[error("token rejected")]
    Rejected,

    /// The authentication backend could not be reached.
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Verifies session tokens. Called once per connection while it is
/// `Authenticating`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<PlayerIdentity, AuthError>;
}

/// Authenticator backed by a fixed token table, loaded from configuration
/// or populated at runtime.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: DashMap<String, PlayerIdentity>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from `(token, identity)` pairs.
    pub fn with_tokens<I, T, P>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, P)>,
        T: Into<String>,
        P: Into<PlayerIdentity>,
    {
        let authenticator = Self::new();
        for (token, identity) in tokens {
            authenticator.insert(token, identity);
        }
        authenticator
    }

    pub fn insert(&self, token: impl Into<String>, identity: impl Into<PlayerIdentity>) {
        self.tokens.insert(token.into(), identity.into());
    }

    /// Invalidates a token. Existing sessions are unaffected.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, token: &str) -> Result<PlayerIdentity, AuthError> {
        self.tokens
            .get(token)
            .map(|identity| identity.value().clone())
            .ok_or(AuthError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verifies_known_tokens_only() {
        let auth = StaticTokenAuthenticator::with_tokens([("tok-A", "alice"), ("tok-B", "bob")]);

        assert_eq!(auth.verify("tok-A").await, Ok(PlayerIdentity::from("alice")));
        assert_eq!(auth.verify("tok-B").await, Ok(PlayerIdentity::from("bob")));
        assert_eq!(auth.verify("tok-C").await, Err(AuthError::Rejected));

        assert!(auth.revoke("tok-A"));
        assert_eq!(auth.verify("tok-A").await, Err(AuthError::Rejected));
        assert_eq!(auth.len(), 1);
    }
}
