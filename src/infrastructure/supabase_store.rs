//! Hosted product store (Supabase PostgREST over HTTPS)
//!
//! Writes use `on_conflict=source,product_url` with
//! `Prefer: resolution=merge-duplicates`, so re-running a scrape updates rows
//! in place instead of duplicating them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::domain::product::{ProductRecord, ProductRow};
use crate::domain::repositories::{BatchWriteReport, ProductStore, StoreError, StoreResult};
use crate::infrastructure::config::DatabaseConfig;

const CONFLICT_COLUMNS: &str = "source,product_url";
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";

pub struct SupabaseStore {
    client: Client,
    table_url: String,
}

impl SupabaseStore {
    pub fn new(config: &DatabaseConfig) -> StoreResult<Self> {
        let base_url = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| StoreError::connection("missing database URL"))?;
        let key = config
            .key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StoreError::Unauthorized {
                status: 0,
                message: "missing database key".to_string(),
            })?;

        let mut headers = HeaderMap::new();
        let invalid_key = |_| StoreError::Unauthorized {
            status: 0,
            message: "database key contains invalid header characters".to_string(),
        };
        headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid_key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid_key)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::connection(format!("failed to build HTTP client: {e}")))?;

        info!("Hosted store configured (table: {})", config.table_name);
        Ok(Self {
            client,
            table_url: table_url(base_url, &config.table_name),
        })
    }

    fn upsert_request(&self) -> RequestBuilder {
        self.client
            .post(&self.table_url)
            .query(&[("on_conflict", CONFLICT_COLUMNS)])
            .header("Prefer", UPSERT_PREFER)
    }

    async fn send(request: RequestBuilder) -> StoreResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::connection(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn write_rows(&self, rows: &[ProductRow]) -> StoreResult<()> {
        Self::send(self.upsert_request().json(rows)).await?;
        Ok(())
    }
}

/// `{base}/rest/v1/{table}` with any trailing slash on `base` removed.
fn table_url(base_url: &str, table: &str) -> String {
    format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table)
}

fn status_error(status: StatusCode, body: String) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized {
            status: status.as_u16(),
            message: body,
        },
        s if s.is_server_error() => StoreError::connection(format!("server error {}: {}", s.as_u16(), body)),
        s => StoreError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}

/// Split rows into groups that serialise with the same keys.
///
/// A bulk insert must carry one column set, and rows without a vector omit
/// `embedding` so the stored one is kept.
fn group_by_columns(rows: Vec<ProductRow>) -> Vec<Vec<ProductRow>> {
    let (with_vector, without_vector): (Vec<_>, Vec<_>) = rows.into_iter().partition(|row| row.embedding.is_some());
    [with_vector, without_vector]
        .into_iter()
        .filter(|group| !group.is_empty())
        .collect()
}

/// Total row count from a `Content-Range` header such as `0-0/123` or `*/0`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

fn eq_filter(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl ProductStore for SupabaseStore {
    async fn health_check(&self) -> StoreResult<()> {
        Self::send(self.client.get(&self.table_url).query(&[("select", "id"), ("limit", "1")])).await?;
        debug!("Hosted store reachable");
        Ok(())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()> {
        self.write_rows(std::slice::from_ref(&product.to_row())).await?;
        debug!("Upserted {} ({})", product.id, product.product_url);
        Ok(())
    }

    /// One request per column set; a rejected request is retried row by row to isolate bad rows.
    async fn upsert_products_batch(&self, products: &[ProductRecord]) -> StoreResult<BatchWriteReport> {
        let mut report = BatchWriteReport::default();

        for group in group_by_columns(products.iter().map(ProductRecord::to_row).collect()) {
            match self.write_rows(&group).await {
                Ok(()) => {
                    report.written += group.len();
                    continue;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Batch of {} rejected, writing rows individually: {}", group.len(), e),
            }

            for row in &group {
                match self.write_rows(std::slice::from_ref(row)).await {
                    Ok(()) => report.written += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.failed.push((row.product_url.clone(), e.to_string())),
                }
            }
        }
        Ok(report)
    }

    async fn product_exists(&self, source: &str, product_url: &str) -> StoreResult<bool> {
        let response = Self::send(self.client.get(&self.table_url).query(&[
            ("select", "id".to_string()),
            ("source", eq_filter(source)),
            ("product_url", eq_filter(product_url)),
            ("limit", "1".to_string()),
        ]))
        .await?;

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| StoreError::connection(format!("unreadable response: {e}")))?;
        Ok(!rows.is_empty())
    }

    async fn count_products(&self, source: &str) -> StoreResult<u64> {
        let response = Self::send(
            self.client
                .get(&self.table_url)
                .query(&[("select", "id".to_string()), ("source", eq_filter(source)), ("limit", "1".to_string())])
                .header("Prefer", "count=exact"),
        )
        .await?;

        let status = response.status().as_u16();
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Rejected {
                status,
                body: "missing or malformed Content-Range header".to_string(),
            })
    }

    async fn products_without_embeddings(&self, source: &str, limit: usize) -> StoreResult<Vec<ProductRecord>> {
        let response = Self::send(self.client.get(&self.table_url).query(&[
            ("select", "*".to_string()),
            ("source", eq_filter(source)),
            ("embedding", "is.null".to_string()),
            ("order", "created_at.asc".to_string()),
            ("limit", limit.to_string()),
        ]))
        .await?;

        let rows: Vec<ProductRow> = response
            .json()
            .await
            .map_err(|e| StoreError::connection(format!("unreadable response: {e}")))?;
        Ok(rows.into_iter().map(ProductRow::into_record).collect())
    }
}
