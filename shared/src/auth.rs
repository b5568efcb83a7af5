//! Bearer token sources for the Google APIs and the CSMS API.
//!
//! Tokens are cached until shortly before the issuer says they expire, and
//! never for longer than `TOKEN_TTL_SECS`.
use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const TOKEN_TTL_SECS: u64 = 300;
/// Subtracted from the issuer's `expires_in` to cover clock skew and request time.
const EXPIRY_MARGIN_SECS: u64 = 60;

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    BadStatus(reqwest::StatusCode),
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// Where a component gets its bearer tokens from.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum TokenConfig {
    MetadataServer {
        #[serde(default = "default_metadata_url")]
        url: Url,
    },
    ClientCredentials {
        token_url: Url,
        client_id: String,
        client_secret: String,
    },
    Static {
        token: String,
    },
}

fn default_metadata_url() -> Url {
    Url::parse(METADATA_TOKEN_URL).expect("metadata token URL is a valid absolute URL")
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig::MetadataServer {
            url: default_metadata_url(),
        }
    }
}

impl TokenConfig {
    pub fn build(&self) -> Arc<dyn TokenSource> {
        match self {
            TokenConfig::MetadataServer { url } => Arc::new(MetadataServerToken::new(url.clone())),
            TokenConfig::ClientCredentials {
                token_url,
                client_id,
                client_secret,
            } => Arc::new(ClientCredentials::new(
                token_url.clone(),
                client_id.clone(),
                client_secret.clone(),
            )),
            TokenConfig::Static { token } => Arc::new(StaticToken::new(token.clone())),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    /// How long the token may be served from the cache.
    fn cache_lifetime(&self) -> Duration {
        let ttl = Duration::from_secs(TOKEN_TTL_SECS);
        match self.expires_in {
            Some(expires_in) => {
                Duration::from_secs(expires_in.saturating_sub(EXPIRY_MARGIN_SECS)).min(ttl)
            }
            None => ttl,
        }
    }
}

/// A fixed token, for local development against emulators.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    lifetime: Duration,
}

struct TokenExpiry;

impl Expiry<(), CachedToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &(),
        value: &CachedToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

struct TokenCache {
    cache: Cache<(), CachedToken>,
}

impl TokenCache {
    fn new() -> Self {
        TokenCache {
            cache: Cache::builder()
                .max_capacity(1)
                .expire_after(TokenExpiry)
                .build(),
        }
    }

    fn get(&self) -> Option<String> {
        self.cache.get(&()).map(|cached| cached.token)
    }

    /// Caches the token for its lifetime and returns it.
    fn insert(&self, response: TokenResponse) -> String {
        let lifetime = response.cache_lifetime();
        if !lifetime.is_zero() {
            self.cache.insert(
                (),
                CachedToken {
                    token: response.access_token.clone(),
                    lifetime,
                },
            );
        }
        response.access_token
    }
}

/// Service-account token from the instance metadata server.
pub struct MetadataServerToken {
    client: reqwest::Client,
    url: Url,
    cache: TokenCache,
}

impl MetadataServerToken {
    pub fn new(url: Url) -> Self {
        MetadataServerToken {
            client: reqwest::Client::new(),
            url,
            cache: TokenCache::new(),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerToken {
    async fn token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        let response = self
            .client
            .get(self.url.clone())
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::BadStatus(response.status()));
        }

        let response = response.json::<TokenResponse>().await?;
        Ok(self.cache.insert(response))
    }
}

/// OAuth client-credentials grant, used for the CSMS API.
pub struct ClientCredentials {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    cache: TokenCache,
}

impl ClientCredentials {
    pub fn new(token_url: Url, client_id: String, client_secret: String) -> Self {
        ClientCredentials {
            client: reqwest::Client::new(),
            token_url,
            client_id,
            client_secret,
            cache: TokenCache::new(),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        let response = self
            .client
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::BadStatus(response.status()));
        }

        let response = response.json::<TokenResponse>().await?;
        Ok(self.cache.insert(response))
    }
}
