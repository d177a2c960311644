//! Image embeddings through a hosted vision-model endpoint
//!
//! Images are downloaded with the shared rate-limited client (optionally
//! cached on disk), posted as raw bytes to the inference endpoint, and the
//! returned vector is checked against the configured dimensionality and
//! L2-normalised.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::infrastructure::config::EmbeddingConfig;
use crate::infrastructure::http_client::{FetchError, HttpClient};
use crate::infrastructure::retry_policy::{Backoff, RetryPolicy};

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Failed to download image: {0}")]
    Download(#[from] FetchError),

    #[error("Inference request failed ({status}): {body}")]
    Inference { status: u16, body: String },

    #[error("Inference endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("Embedding is a zero vector")]
    ZeroVector,
}

impl EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Download(e) => e.is_retryable(),
            Self::Inference { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500,
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::InvalidResponse(_) | Self::Dimension { .. } | Self::ZeroVector => false,
        }
    }
}

pub type EmbeddingResult = Result<Vec<f32>, EmbeddingError>;

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    async fn embed(&self, image_url: &str) -> EmbeddingResult;

    /// Embed several images; one result per distinct URL.
    async fn embed_batch(&self, image_urls: &[String]) -> HashMap<String, EmbeddingResult> {
        let mut results = HashMap::new();
        for url in image_urls {
            if !results.contains_key(url) {
                let result = self.embed(url).await;
                results.insert(url.clone(), result);
            }
        }
        results
    }
}

/// Scale `vector` to unit length, checking its dimensionality first.
pub fn l2_normalize(mut vector: Vec<f32>, expected: usize) -> EmbeddingResult {
    if vector.len() != expected {
        return Err(EmbeddingError::Dimension {
            expected,
            actual: vector.len(),
        });
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbeddingError::ZeroVector);
    }
    vector.iter_mut().for_each(|v| *v /= norm);
    Ok(vector)
}

/// Downloaded image bytes keyed by a hash of the image URL.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.img", blake3::hash(url.as_bytes()).to_hex()))
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.path_for(url)).await.ok()
    }

    pub async fn put(&self, url: &str, bytes: &[u8]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("Cannot create image cache {:?}: {}", self.dir, e);
            return;
        }
        if let Err(e) = tokio::fs::write(self.path_for(url), bytes).await {
            warn!("Failed to cache image {}: {}", url, e);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Object { embedding: Vec<f32> },
    Batch(Vec<Vec<f32>>),
    Flat(Vec<f32>),
}

impl EmbeddingResponse {
    fn into_vector(self) -> Result<Vec<f32>, EmbeddingError> {
        match self {
            Self::Object { embedding } | Self::Flat(embedding) => Ok(embedding),
            Self::Batch(mut rows) => match rows.len() {
                1 => Ok(rows.remove(0)),
                n => Err(EmbeddingError::InvalidResponse(format!("expected 1 vector, got {n}"))),
            },
        }
    }
}

/// Embedder backed by an HTTP inference endpoint serving a pretrained vision encoder.
pub struct HttpImageEmbedder {
    client: Client,
    http: Arc<HttpClient>,
    endpoint: String,
    model: String,
    dimensions: usize,
    concurrency: usize,
    cache: Option<ImageCache>,
    retry: RetryPolicy,
}

impl HttpImageEmbedder {
    pub fn new(config: &EmbeddingConfig, http: Arc<HttpClient>) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.endpoint.trim().is_empty(), "missing embedding endpoint");
        anyhow::ensure!(config.dimensions > 0, "embedding dimensions must be positive");

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key.trim())).context("invalid embedding API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            http,
            endpoint: config.endpoint.clone(),
            model: config.model_name.clone(),
            dimensions: config.dimensions,
            concurrency: config.batch_size.max(1),
            cache: config.cache_dir.clone().map(ImageCache::new),
            retry: RetryPolicy::new(config.max_retries, 500, 8_000, Backoff::Exponential { factor: 2.0 }),
        })
    }

    async fn image_bytes(&self, image_url: &str) -> Result<Vec<u8>, EmbeddingError> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(image_url).await {
                debug!("Image cache hit: {}", image_url);
                return Ok(bytes);
            }
        }

        let bytes = self
            .retry
            .run_if("image download", FetchError::is_retryable, |_| self.http.get_bytes(image_url))
            .await?;

        if let Some(cache) = &self.cache {
            cache.put(image_url, &bytes).await;
        }
        Ok(bytes)
    }

    async fn infer(&self, bytes: Vec<u8>) -> EmbeddingResult {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("model", self.model.as_str())])
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::Inference {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        parsed.into_vector()
    }
}

#[async_trait]
impl ImageEmbedder for HttpImageEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, image_url: &str) -> EmbeddingResult {
        let bytes = self.image_bytes(image_url).await?;
        let vector = self
            .retry
            .run_if("embedding inference", EmbeddingError::is_retryable, |_| self.infer(bytes.clone()))
            .await?;
        l2_normalize(vector, self.dimensions)
    }

    async fn embed_batch(&self, image_urls: &[String]) -> HashMap<String, EmbeddingResult> {
        let mut unique: Vec<&String> = Vec::new();
        for url in image_urls {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }

        stream::iter(unique.into_iter().cloned().collect::<Vec<String>>())
            .map(|url| async move {
                let result = self.embed(&url).await;
                (url, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0], 2).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_dimension_is_rejected() {
        let err = l2_normalize(vec![1.0; 512], 768).unwrap_err();
        assert!(matches!(err, EmbeddingError::Dimension { expected: 768, actual: 512 }));
        assert!(matches!(l2_normalize(vec![0.0; 4], 4), Err(EmbeddingError::ZeroVector)));
    }

    #[test]
    fn test_response_shapes() {
        let object: EmbeddingResponse = serde_json::from_str(r#"{"embedding":[0.1,0.2]}"#).unwrap();
        assert_eq!(object.into_vector().unwrap(), vec![0.1, 0.2]);

        let batch: EmbeddingResponse = serde_json::from_str("[[0.5,0.5]]").unwrap();
        assert_eq!(batch.into_vector().unwrap(), vec![0.5, 0.5]);

        let flat: EmbeddingResponse = serde_json::from_str("[1.0,2.0,3.0]").unwrap();
        assert_eq!(flat.into_vector().unwrap().len(), 3);

        let many: EmbeddingResponse = serde_json::from_str("[[1.0],[2.0]]").unwrap();
        assert!(many.into_vector().is_err());
    }

    #[tokio::test]
    async fn test_image_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("images"));
        let url = "https://img.example.com/a.jpg";

        assert!(cache.get(url).await.is_none());
        cache.put(url, b"jpeg-bytes").await;
        assert_eq!(cache.get(url).await.as_deref(), Some(&b"jpeg-bytes"[..]));
        assert!(cache.get("https://img.example.com/b.jpg").await.is_none());
    }

    #[test]
    fn test_inference_retry_classification() {
        assert!(EmbeddingError::Inference { status: 503, body: String::new() }.is_retryable());
        assert!(EmbeddingError::Inference { status: 429, body: String::new() }.is_retryable());
        assert!(!EmbeddingError::Inference { status: 400, body: String::new() }.is_retryable());
        assert!(!EmbeddingError::Dimension { expected: 768, actual: 3 }.is_retryable());
    }

    struct CountingEmbedder;

    #[async_trait]
    impl ImageEmbedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, image_url: &str) -> EmbeddingResult {
            if image_url.contains("broken") {
                Err(EmbeddingError::ZeroVector)
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    #[tokio::test]
    async fn test_default_batch_deduplicates() {
        let urls = vec!["https://i/a.jpg".to_string(), "https://i/broken.jpg".to_string(), "https://i/a.jpg".to_string()];
        let results = CountingEmbedder.embed_batch(&urls).await;
        assert_eq!(results.len(), 2);
        assert!(results["https://i/a.jpg"].is_ok());
        assert!(results["https://i/broken.jpg"].is_err());
    }
}
