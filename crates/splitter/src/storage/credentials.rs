use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Deserialize;
use tokio::sync::Mutex;
use crate::config::DropboxCredentials;
use crate::error::StorageError;

const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const TOKEN_TIMEOUT: Duration = Duration::from_secs(20);
/// Refresh this long before the reported expiry
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Supplies bearer tokens to the storage backend
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, StorageError>;
}

/// A fixed, long-lived access token
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String, StorageError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth refresh-token grant, cached until shortly before expiry
pub struct RefreshingToken {
    client: reqwest::Client,
    token_url: String,
    refresh_token: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl RefreshingToken {
    pub fn new(
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(TOKEN_TIMEOUT)
            .build()
            .map_err(|e| StorageError::fatal(None, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token_url: TOKEN_URL.to_string(),
            refresh_token: refresh_token.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        })
    }

    /// Point the grant at another token endpoint
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    async fn refresh(&self) -> Result<CachedToken, StorageError> {
        debug!("Refreshing storage access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::from_status(
                status.as_u16(),
                format!("token refresh failed ({}): {}", status, body),
            ));
        }

        let body: TokenResponse = response.json().await?;
        let lifetime = body.expires_in.unwrap_or(4 * 3600);
        info!("Obtained storage access token (expires in {}s)", lifetime);

        Ok(CachedToken {
            token: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime - EXPIRY_MARGIN_SECS),
        })
    }
}

#[async_trait]
impl CredentialProvider for RefreshingToken {
    async fn access_token(&self) -> Result<String, StorageError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.token.clone());
            }
        }
        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// Pick a provider from configured credentials: refresh grant first, then a static token
pub fn provider_from_credentials(
    creds: &DropboxCredentials,
) -> Result<Box<dyn CredentialProvider>, StorageError> {
    if let (Some(refresh), Some(id), Some(secret)) = (
        creds.refresh_token.as_ref(),
        creds.client_id.as_ref(),
        creds.client_secret.as_ref(),
    ) {
        return Ok(Box::new(RefreshingToken::new(refresh, id, secret)?));
    }
    if let Some(token) = creds.access_token.as_ref() {
        return Ok(Box::new(StaticToken::new(token)));
    }
    Err(StorageError::fatal(
        None,
        "no Dropbox token configured (refresh or access)",
    ))
}
