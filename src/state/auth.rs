//! Identity provider capability.
//!
//! Authentication itself lives outside this crate. Connections only need
//! two operations: resume a session from tokens, or mint an anonymous user.
//! [`MemoryAuthProvider`] is a self-contained provider for tests and local
//! runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::SnowflakeGenerator;

/// Long-lived tokens the client keeps between visits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub tokens: AuthTokens,
}

/// Authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid auth tokens")]
    InvalidTokens,

    #[error("auth tokens expired")]
    Expired,

    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// External authentication capability.
pub trait AuthProvider: Send + Sync + 'static {
    /// Resolve the user owning `tokens`, possibly rotating them.
    fn authenticate(
        &self,
        tokens: AuthTokens,
    ) -> impl Future<Output = Result<AuthSession, AuthError>> + Send;

    /// Create a new anonymous user.
    fn create_anonymous(&self) -> impl Future<Output = Result<AuthSession, AuthError>> + Send;
}

/// Authenticate with `tokens` when present, otherwise create an anonymous user.
pub async fn resolve_or_create_session<A: AuthProvider>(
    provider: &A,
    tokens: Option<AuthTokens>,
) -> Result<AuthSession, AuthError> {
    match tokens {
        Some(tokens) => provider.authenticate(tokens).await,
        None => provider.create_anonymous().await,
    }
}

/// In-process provider keyed by access token.
#[derive(Debug, Default)]
pub struct MemoryAuthProvider {
    ids: SnowflakeGenerator,
    sessions: Mutex<HashMap<String, String>>,
    revoked: Mutex<HashMap<String, String>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    unavailable: Mutex<Option<String>>,
}

impl MemoryAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to simulate a remote provider.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of authenticate/create calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every following call fail with `Unavailable`, or clear the outage.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock() = reason.map(str::to_string);
    }

    /// Expire an access token; later use yields `AuthError::Expired`.
    pub fn revoke(&self, access_token: &str) {
        if let Some(user_id) = self.sessions.lock().remove(access_token) {
            self.revoked.lock().insert(access_token.to_string(), user_id);
        }
    }

    fn issue(&self, user_id: String) -> AuthSession {
        let tokens = AuthTokens {
            access_token: format!("at-{}", self.ids.next_id()),
            refresh_token: format!("rt-{}", self.ids.next_id()),
        };
        self.sessions
            .lock()
            .insert(tokens.access_token.clone(), user_id.clone());
        AuthSession { user_id, tokens }
    }

    async fn enter(&self) -> Result<(), AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.unavailable.lock().clone() {
            Some(reason) => Err(AuthError::Unavailable(reason)),
            None => Ok(()),
        }
    }
}

impl AuthProvider for MemoryAuthProvider {
    async fn authenticate(&self, tokens: AuthTokens) -> Result<AuthSession, AuthError> {
        self.enter().await?;
        let user_id = self.sessions.lock().get(&tokens.access_token).cloned();
        match user_id {
            Some(user_id) => Ok(AuthSession { user_id, tokens }),
            None if self.revoked.lock().contains_key(&tokens.access_token) => Err(AuthError::Expired),
            None => Err(AuthError::InvalidTokens),
        }
    }

    async fn create_anonymous(&self) -> Result<AuthSession, AuthError> {
        self.enter().await?;
        let user_id = format!("anon-{}", self.ids.next_id());
        Ok(self.issue(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_then_resume() {
        let provider = MemoryAuthProvider::new();

        let created = resolve_or_create_session(&provider, None).await.unwrap();
        assert!(created.user_id.starts_with("anon-"));

        let resumed = resolve_or_create_session(&provider, Some(created.tokens.clone()))
            .await
            .unwrap();
        assert_eq!(resumed.user_id, created.user_id);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tokens_rejected() {
        let provider = MemoryAuthProvider::new();
        let tokens = AuthTokens {
            access_token: "nope".into(),
            refresh_token: "nope".into(),
        };
        assert_eq!(
            provider.authenticate(tokens).await,
            Err(AuthError::InvalidTokens)
        );
    }

    #[tokio::test]
    async fn test_revoked_tokens_expired() {
        let provider = MemoryAuthProvider::new();
        let session = provider.create_anonymous().await.unwrap();
        provider.revoke(&session.tokens.access_token);

        assert_eq!(
            provider.authenticate(session.tokens).await,
            Err(AuthError::Expired)
        );
    }

    #[tokio::test]
    async fn test_outage() {
        let provider = MemoryAuthProvider::new();
        provider.set_unavailable(Some("maintenance"));
        assert_eq!(
            provider.create_anonymous().await,
            Err(AuthError::Unavailable("maintenance".into()))
        );

        provider.set_unavailable(None);
        assert!(provider.create_anonymous().await.is_ok());
    }
}
