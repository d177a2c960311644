//! Page sources turn a URL into rendered HTML
//!
//! The browser source renders client-side markup; the HTTP source is enough
//! for server-rendered sites and is much cheaper.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::http_client::{FetchError, HttpClient};

/// What kind of page is being loaded; listings get scrolled to trigger lazy loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Listing,
    Product,
}

#[derive(Error, Debug)]
pub enum PageLoadError {
    #[error("Timed out loading {url} after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Browser failed on {url}: {message}")]
    Browser { url: String, message: String },

    #[error("Page source unavailable: {message}")]
    Unavailable { message: String },
}

impl PageLoadError {
    pub fn browser(url: &str, error: impl std::fmt::Display) -> Self {
        Self::Browser {
            url: url.to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Browser { .. } => true,
            Self::Fetch(e) => e.is_retryable(),
            Self::Unavailable { .. } => false,
        }
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Load `url` and return its rendered HTML.
    async fn load(&self, url: &str, kind: PageKind) -> Result<String, PageLoadError>;

    /// Release external resources (browser process, connections).
    async fn shutdown(&self) {}
}

/// Plain HTTP page source
pub struct HttpPageSource {
    client: Arc<HttpClient>,
    cancel: CancellationToken,
}

impl HttpPageSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight requests when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn load(&self, url: &str, _kind: PageKind) -> Result<String, PageLoadError> {
        Ok(self.client.get_text_with_cancellation(url, &self.cancel).await?)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned HTML by URL and records every load.
    #[derive(Default)]
    pub struct StaticPageSource {
        pages: HashMap<String, String>,
        pub loads: Mutex<Vec<String>>,
    }

    impl StaticPageSource {
        pub fn with_page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        pub fn load_count(&self, url: &str) -> usize {
            self.loads.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl PageSource for StaticPageSource {
        async fn load(&self, url: &str, _kind: PageKind) -> Result<String, PageLoadError> {
            self.loads.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| {
                PageLoadError::Fetch(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PageLoadError::Timeout { url: "u".into(), timeout_ms: 10 }.is_retryable());
        assert!(PageLoadError::browser("u", "target crashed").is_retryable());
        assert!(!PageLoadError::Fetch(FetchError::Status { status: 404, url: "u".into() }).is_retryable());
        assert!(!PageLoadError::Unavailable { message: "closed".into() }.is_retryable());
    }

    #[tokio::test]
    async fn test_http_source_stops_after_cancellation() {
        let client = Arc::new(HttpClient::new(Default::default()).unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = HttpPageSource::new(client).with_cancellation(cancel);

        let err = source.load("http://127.0.0.1:9/", PageKind::Listing).await.unwrap_err();
        assert!(matches!(err, PageLoadError::Fetch(FetchError::Cancelled { .. })));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_static_source_serves_fixtures() {
        let source = fixtures::StaticPageSource::default().with_page("https://x/p/1", "<h1>One</h1>");
        assert_eq!(source.load("https://x/p/1", PageKind::Product).await.unwrap(), "<h1>One</h1>");
        assert!(source.load("https://x/p/2", PageKind::Product).await.is_err());
        assert_eq!(source.load_count("https://x/p/1"), 1);
    }
}
