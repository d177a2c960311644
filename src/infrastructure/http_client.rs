//! HTTP client with rate limiting for page and image fetches
//!
//! Every request waits on a shared token bucket so page loads and image
//! downloads together stay under the configured request rate.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::Context;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client, Response,
    header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::{ScrapingConfig, defaults};

/// HTTP client configuration
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_requests_per_second: u32,
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::USER_AGENT.to_string(),
            timeout_ms: defaults::TIMEOUT_MS,
            max_requests_per_second: defaults::REQUESTS_PER_SECOND,
            follow_redirects: true,
        }
    }
}

impl From<&ScrapingConfig> for HttpClientConfig {
    fn from(config: &ScrapingConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout_ms: config.timeout_ms,
            max_requests_per_second: config.requests_per_second,
            follow_redirects: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed with status {status}: {url}")]
    Status { status: u16, url: String },

    #[error("Failed to fetch URL {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request cancelled: {url}")]
    Cancelled { url: String },
}

impl FetchError {
    /// Rate limiting, server errors and transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { .. } => true,
            Self::Cancelled { .. } => false,
        }
    }

    fn transport(url: &str, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            source,
        }
    }
}

/// Rate-limited HTTP client
pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en;q=0.9"));

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second).context("Rate limit must be greater than 0")?,
        );
        let rate_limiter = RateLimiter::direct(quota);

        Ok(Self {
            client,
            rate_limiter,
            config,
        })
    }

    /// Fetch a URL with rate limiting; non-2xx statuses are errors.
    pub async fn get(&self, url: &str) -> Result<Response, FetchError> {
        self.rate_limiter.until_ready().await;

        tracing::debug!("Fetching URL: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| FetchError::transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url).await?;
        response.text().await.map_err(|e| FetchError::transport(url, e))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url).await?;
        let bytes = response.bytes().await.map_err(|e| FetchError::transport(url, e))?;
        Ok(bytes.to_vec())
    }

    /// Fetch URL text, aborting promptly when `cancellation_token` fires.
    pub async fn get_text_with_cancellation(
        &self,
        url: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<String, FetchError> {
        let cancelled = || FetchError::Cancelled { url: url.to_string() };

        if cancellation_token.is_cancelled() {
            return Err(cancelled());
        }

        tokio::select! {
            result = self.get_text(url) => result,
            () = cancellation_token.cancelled() => {
                tracing::warn!("HTTP request cancelled for URL: {}", url);
                Err(cancelled())
            }
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}
