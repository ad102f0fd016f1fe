//! HTTP plumbing shared by both upstream adapters: client construction,
//! optional mutual-TLS identity, status classification, GET retries and the
//! client-credentials token cache.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod token;

pub use token::{
    needs_refresh, BearerToken, ClientCredentials, TokenCache, DEFAULT_REFRESH_MARGIN_SECS,
    MAX_TOKEN_LIFETIME_SECS,
};

pub const CRATE_NAME: &str = "adsync-transport";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(u32::try_from(attempt_index).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// PEM certificate and private key used to authenticate the client over TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl ClientIdentity {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    pub fn load(&self) -> Result<reqwest::Identity, TransportError> {
        let cert = std::fs::read(&self.cert_file).map_err(|e| {
            TransportError::Configuration(format!(
                "reading client certificate {}: {e}",
                self.cert_file.display()
            ))
        })?;
        let key = std::fs::read(&self.key_file).map_err(|e| {
            TransportError::Configuration(format!(
                "reading client key {}: {e}",
                self.key_file.display()
            ))
        })?;

        let mut pem = cert;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&key);

        reqwest::Identity::from_pem(&pem).map_err(|e| {
            TransportError::Configuration(format!(
                "loading client certificate {} with key {}: {e}",
                self.cert_file.display(),
                self.key_file.display()
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub identity: Option<ClientIdentity>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            identity: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status.as_u16(),
                body: self.body_text(),
                url: self.url,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }
}

/// Thin wrapper over a configured `reqwest::Client` for one upstream service.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    upstream: &'static str,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(upstream: &'static str, config: &HttpClientConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(identity) = &config.identity {
            builder = builder.use_rustls_tls().identity(identity.load()?);
        }

        let client = builder.build().map_err(|e| {
            TransportError::Configuration(format!("building {upstream} http client: {e}"))
        })?;

        Ok(Self::with_client(upstream, client, config.backoff))
    }

    pub fn with_client(upstream: &'static str, client: reqwest::Client, backoff: BackoffPolicy) -> Self {
        Self {
            upstream,
            client,
            backoff,
        }
    }

    pub fn upstream(&self) -> &'static str {
        self.upstream
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends a request once. Non-success statuses are returned, not raised.
    pub async fn send(&self, request: RequestBuilder) -> Result<FetchedResponse, TransportError> {
        let request = request.build()?;
        let url = request.url().to_string();
        let span = info_span!("http_request", upstream = self.upstream, method = %request.method(), url = %url);

        async {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok::<_, TransportError>(FetchedResponse { status, url, body })
        }
        .instrument(span)
        .await
    }

    /// Sends an idempotent request, retrying retryable failures with backoff.
    ///
    /// `build` is invoked once per attempt so each attempt carries fresh
    /// headers.
    pub async fn send_idempotent<F>(&self, build: F) -> Result<FetchedResponse, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match self.send(build()).await {
                Ok(resp) => {
                    if resp.status.is_success()
                        || classify_status(resp.status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Ok(resp);
                    }
                    debug!(upstream = self.upstream, status = resp.status.as_u16(), attempt, "retrying after status");
                }
                Err(TransportError::Request(err))
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    debug!(upstream = self.upstream, error = %err, attempt, "retrying after request error");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
