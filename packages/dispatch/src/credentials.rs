//! Bearer tokens for the batch service.
//!
//! [`CachedCredentials`] wraps a [`TokenSource`] and hands out the cached
//! token until it is within [`REFRESH_MARGIN_MINUTES`] of expiry.

use async_trait::async_trait;
use chirps_cog_config::{ConfigError, require_env};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Tokens expiring within this many minutes are refreshed.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Lifetime assumed when the endpoint reports an unrepresentable expiry.
const FALLBACK_LIFETIME_MINUTES: i64 = 10;

/// Default token authority.
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Errors from obtaining a token.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// A required credential variable is missing.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The token request failed.
    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint rejected the request.
    #[error("Token endpoint returned HTTP {status}: {body}")]
    Status {
        /// Response status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// A bearer token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The token value.
    pub secret: String,
    /// Instant the token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// Anything that can mint a fresh token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Requests a new token.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] if no token can be obtained.
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError>;
}

/// Provides a currently valid bearer token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a token valid for at least the refresh margin.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] if a refresh is needed and fails.
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// Caches tokens from a [`TokenSource`], refreshing them shortly before
/// they expire.
pub struct CachedCredentials<S> {
    source: S,
    cached: Mutex<Option<AccessToken>>,
    refresh_margin: Duration,
}

impl<S: TokenSource> CachedCredentials<S> {
    /// Wraps `source` with the default refresh margin.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            refresh_margin: Duration::minutes(REFRESH_MARGIN_MINUTES),
        }
    }

    async fn token_at(&self, now: DateTime<Utc>) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref()
            && now
                .checked_add_signed(self.refresh_margin)
                .is_some_and(|deadline| token.expires_at > deadline)
        {
            return Ok(token.secret.clone());
        }

        log::debug!("Refreshing batch service token");
        let token = self.source.fetch_token().await?;
        let secret = token.secret.clone();
        *cached = Some(token);
        Ok(secret)
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for CachedCredentials<S> {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        self.token_at(Utc::now()).await
    }
}

/// A pre-issued token that never needs refreshing.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken {
            secret: self.0.clone(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// OAuth2 client-credentials grant against an Entra ID tenant.
pub struct ClientSecretTokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ClientSecretTokenSource {
    /// Creates a source for `tenant_id`.
    #[must_use]
    pub fn new(tenant_id: &str, client_id: &str, client_secret: &str, scope: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: format!("{DEFAULT_AUTHORITY}/{tenant_id}/oauth2/v2.0/token"),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scope.to_string(),
        }
    }

    /// Reads `BATCH_TENANT_ID`, `BATCH_CLIENT_ID` and `BATCH_CLIENT_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] if a variable is unset.
    pub fn from_env(scope: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(
            &require_env("BATCH_TENANT_ID")?,
            &require_env("BATCH_CLIENT_ID")?,
            &require_env("BATCH_CLIENT_SECRET")?,
            scope,
        ))
    }
}

#[async_trait]
impl TokenSource for ClientSecretTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        let requested_at = Utc::now();
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let token: TokenResponse = response.json().await?;
        log::info!("Obtained batch service token (expires in {}s)", token.expires_in);
        Ok(AccessToken {
            secret: token.access_token,
            expires_at: expiry_after(requested_at, token.expires_in),
        })
    }
}

/// When a token issued at `requested_at` with an `expires_in` of seconds
/// stops being valid.
fn expiry_after(requested_at: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| requested_at.checked_add_signed(lifetime))
        .unwrap_or_else(|| {
            log::warn!("Token lifetime of {expires_in}s is out of range, refreshing early");
            requested_at + Duration::minutes(FALLBACK_LIFETIME_MINUTES)
        })
}
