//! OAuth2 client-credentials token cache.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{HttpTransport, TransportError};

/// Seconds before expiry at which a cached token is proactively replaced.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

/// Upper bound applied to an upstream `expires_in`.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 366 * 24 * 60 * 60;

/// Client-credentials grant parameters for one upstream token endpoint.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// True when `token` is absent or within `margin` of its expiry at `now`.
pub fn needs_refresh(token: Option<&BearerToken>, now: DateTime<Utc>, margin: Duration) -> bool {
    match token {
        Some(token) => token
            .expires_at
            .checked_sub_signed(margin)
            .map_or(true, |refresh_at| now >= refresh_at),
        None => true,
    }
}

/// Holds one bearer token per upstream and refreshes it on demand.
///
/// The cache state sits behind a single async mutex that stays locked for the
/// duration of a refresh, so concurrent callers never issue duplicate token
/// requests and all observe the same refreshed token.
#[derive(Debug)]
pub struct TokenCache {
    credentials: ClientCredentials,
    http: HttpTransport,
    refresh_margin: Duration,
    cached: Mutex<Option<BearerToken>>,
}

impl TokenCache {
    pub fn new(
        credentials: ClientCredentials,
        http: HttpTransport,
        refresh_margin: Duration,
    ) -> Result<Self, TransportError> {
        for (name, value) in [
            ("client id", &credentials.client_id),
            ("client secret", &credentials.client_secret),
            ("token url", &credentials.token_url),
        ] {
            if value.trim().is_empty() {
                return Err(TransportError::Configuration(format!(
                    "{} {name} is required",
                    http.upstream()
                )));
            }
        }
        Ok(Self {
            credentials,
            http,
            refresh_margin,
            cached: Mutex::new(None),
        })
    }

    /// Returns a token that is valid for at least the refresh margin.
    pub async fn valid_token(&self) -> Result<BearerToken, TransportError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if !needs_refresh(cached.as_ref(), now, self.refresh_margin) {
            if let Some(token) = cached.as_ref() {
                debug!(upstream = self.http.upstream(), "using cached token");
                return Ok(token.clone());
            }
        }

        match self.exchange().await {
            Ok(token) => {
                info!(
                    upstream = self.http.upstream(),
                    expires_at = %token.expires_at,
                    "acquired access token"
                );
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                let still_valid = cached
                    .as_ref()
                    .is_some_and(|token| Utc::now() < token.expires_at);
                if !still_valid {
                    *cached = None;
                }
                warn!(upstream = self.http.upstream(), retained_previous = still_valid, error = %err, "token refresh failed");
                Err(err)
            }
        }
    }

    /// Currently cached token, without refreshing it.
    pub async fn cached(&self) -> Option<BearerToken> {
        self.cached.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange(&self) -> Result<BearerToken, TransportError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        let request = self
            .http
            .client()
            .post(&self.credentials.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form);

        let resp = self.http.send(request).await.map_err(|e| {
            TransportError::Authentication(format!(
                "{} token request failed: {e}",
                self.http.upstream()
            ))
        })?;

        if !resp.status.is_success() {
            return Err(TransportError::Authentication(format!(
                "{} token request failed with status {}: {}",
                self.http.upstream(),
                resp.status.as_u16(),
                resp.body_text()
            )));
        }

        let parsed: TokenResponse = resp.json().map_err(|e| {
            TransportError::Authentication(format!(
                "{} token response unreadable: {e}",
                self.http.upstream()
            ))
        })?;

        Ok(BearerToken {
            access_token: parsed.access_token,
            expires_at: expiry_after(Utc::now(), parsed.expires_in)
                .ok_or_else(|| {
                    TransportError::Authentication(format!(
                        "{} token lifetime out of range",
                        self.http.upstream()
                    ))
                })?,
        })
    }
}

/// Expiry instant for a token issued at `now`. Missing or negative lifetimes
/// mean already expired; lifetimes are capped at `MAX_TOKEN_LIFETIME_SECS`.
fn expiry_after(now: DateTime<Utc>, expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    let secs = expires_in.unwrap_or(0).clamp(0, MAX_TOKEN_LIFETIME_SECS);
    now.checked_add_signed(Duration::try_seconds(secs)?)
}
