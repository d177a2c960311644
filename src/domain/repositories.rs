//! Repository interfaces for product persistence
//!
//! Stores write through an idempotent upsert keyed by `(source, product_url)`.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::product::ProductRecord;

/// Errors raised by a [`ProductStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Store unreachable: {message}")]
    Connection { message: String },

    #[error("Store rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to (de)serialize row: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Credential and connectivity failures abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Connection { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a batch upsert.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchWriteReport {
    pub written: usize,
    /// Product URLs that could not be written, with the reason
    pub failed: Vec<(String, String)>,
}

impl BatchWriteReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Verify credentials and connectivity.
    async fn health_check(&self) -> StoreResult<()>;

    /// Insert or overwrite the row for `(source, product_url)`.
    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()>;

    /// Upsert many records. Fatal errors are returned; per-row failures are reported.
    async fn upsert_products_batch(&self, products: &[ProductRecord]) -> StoreResult<BatchWriteReport> {
        let mut report = BatchWriteReport::default();
        for product in products {
            match self.upsert_product(product).await {
                Ok(()) => report.written += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => report.failed.push((product.product_url.clone(), e.to_string())),
            }
        }
        Ok(report)
    }

    async fn product_exists(&self, source: &str, product_url: &str) -> StoreResult<bool>;

    async fn count_products(&self, source: &str) -> StoreResult<u64>;

    async fn products_without_embeddings(&self, source: &str, limit: usize) -> StoreResult<Vec<ProductRecord>>;
}
