//! Credentials for the hub handshake
//!
//! The OAuth dance lives outside this crate. The handshake needs exactly
//! three things from a credential source: the current access token, whether
//! it is stale, and a way to refresh it. [`TokenGate`] sits in front of the
//! source and serializes refreshes, so overlapping handshake attempts never
//! trigger two refreshes at once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// A source of hub access tokens.
///
/// Implementations that refresh over HTTP should return
/// [`HearthError::InvalidAuth`](crate::HearthError::InvalidAuth) when the
/// refresh token itself is rejected; that aborts connecting permanently
/// instead of burning the retry budget.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Current access token, sent verbatim in the auth frame.
    fn access_token(&self) -> String;

    /// Whether the token must be refreshed before use.
    fn is_expired(&self) -> bool;

    /// Obtain a fresh access token.
    async fn refresh(&self) -> Result<()>;
}

/// Long-lived access token: never expires, nothing to refresh.
pub struct LongLivedToken {
    token: String,
}

impl LongLivedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl Credentials for LongLivedToken {
    fn access_token(&self) -> String {
        self.token.clone()
    }

    fn is_expired(&self) -> bool {
        false
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Serializes token refreshes across concurrent handshake attempts.
///
/// The expiry check runs again under the lock: a waiter that queued behind
/// an in-flight refresh finds the token already fresh and skips its own.
pub(crate) struct TokenGate {
    credentials: Arc<dyn Credentials>,
    refresh_gate: Mutex<()>,
}

impl TokenGate {
    pub(crate) fn new(credentials: Arc<dyn Credentials>) -> Self {
        Self {
            credentials,
            refresh_gate: Mutex::new(()),
        }
    }

    /// A token that was fresh at the moment of the call.
    pub(crate) async fn fresh_token(&self) -> Result<String> {
        if self.credentials.is_expired() {
            let _guard = self.refresh_gate.lock().await;
            if self.credentials.is_expired() {
                debug!("Access token expired, refreshing");
                self.credentials.refresh().await?;
            }
        }
        Ok(self.credentials.access_token())
    }
}
