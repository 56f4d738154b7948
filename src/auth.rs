//! Per-user authentication sessions
//!
//! An [`AuthSession`] caches one virtual user's bearer token and knows how to
//! get a new one from a [`TokenProvider`]. The lifecycle is deliberately lazy:
//!
//! 1. A session starts without a token.
//! 2. [`AuthSession::ensure_token`] acquires one on first use and caches it,
//!    together with its expiry when the provider reports one.
//! 3. When the target service answers 401 the owner calls
//!    [`AuthSession::invalidate`]; the next `ensure_token` re-acquires.
//!
//! Tokens without a reported expiry are kept until a 401 says otherwise; the
//! session never guesses.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Resource-owner credentials for the identity provider.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// A freshly issued token.
#[derive(Clone, Debug)]
pub struct Grant {
    pub token: Token,
    pub expires_in: Option<Duration>,
}

impl Grant {
    pub fn new(token: Token, expires_in: Option<Duration>) -> Self {
        Self { token, expires_in }
    }
}

#[derive(Clone, Debug, Error)]
pub enum AuthError {
    #[error("token endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("token endpoint rejected the credentials with status {status}")]
    Rejected { status: u16 },
    #[error("token endpoint returned an unusable response: {0}")]
    Malformed(String),
}

/// The identity provider a session acquires tokens from.
///
/// One provider is shared by every virtual user; implementations must be
/// cheap to call concurrently.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire(&self, credentials: &Credentials) -> Result<Grant, AuthError>;
}

#[derive(Default)]
struct CachedToken {
    token: Option<Token>,
    expires_at: Option<Instant>,
    /// Bumped on every invalidation so an acquisition that straddles an
    /// invalidation does not repopulate the cache.
    epoch: u64,
}

/// One virtual user's credential and token state.
pub struct AuthSession {
    credentials: Credentials,
    provider: Arc<dyn TokenProvider>,
    cache: Mutex<CachedToken>,
    /// Held across a provider call: at most one acquisition is in flight.
    acquiring: tokio::sync::Mutex<()>,
    acquisitions: AtomicU64,
}

impl AuthSession {
    pub fn new(credentials: Credentials, provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            credentials,
            provider,
            cache: Mutex::new(CachedToken::default()),
            acquiring: tokio::sync::Mutex::new(()),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The cached token, unless there is none or it is known to be expired.
    pub fn current(&self) -> Option<Token> {
        let cache = self.cache.lock();
        match (&cache.token, cache.expires_at) {
            (Some(_), Some(at)) if Instant::now() >= at => None,
            (token, _) => token.clone(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.current().is_some()
    }

    /// Number of provider calls this session has issued.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Return a usable token, acquiring one if needed.
    ///
    /// Concurrent callers share a single acquisition: whoever gets the
    /// acquisition lock second finds the token already cached.
    pub async fn ensure_token(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.current() {
            return Ok(token);
        }

        let _guard = self.acquiring.lock().await;
        if let Some(token) = self.current() {
            return Ok(token);
        }

        let epoch = self.cache.lock().epoch;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let grant = self.provider.acquire(&self.credentials).await?;

        let mut cache = self.cache.lock();
        if cache.epoch == epoch {
            cache.token = Some(grant.token.clone());
            cache.expires_at = grant.expires_in.map(|ttl| Instant::now() + ttl);
        } else {
            tracing::debug!(
                "Session for {} invalidated during acquisition; not caching the new token",
                self.credentials.username
            );
        }
        Ok(grant.token)
    }

    /// Forget the cached token. Takes effect immediately, even while an
    /// acquisition is pending.
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock();
        cache.token = None;
        cache.expires_at = None;
        cache.epoch += 1;
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("credentials", &self.credentials)
            .field("has_token", &self.has_token())
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}
