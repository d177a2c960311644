//! Local SQLite product store
//!
//! Mirrors the hosted `products` table so runs can persist offline. `(id, source)`
//! is the primary key and `(source, product_url)` is unique; an upsert that hits
//! either one updates the existing row.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::domain::product::{ProductRecord, ProductRow};
use crate::domain::repositories::{BatchWriteReport, ProductStore, StoreError, StoreResult};

/// SQLite connection pool
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let in_memory = database_url.contains(":memory:");

        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:")
                .split('?')
                .next()
                .unwrap_or_default();
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::connection(format!("cannot create {parent:?}: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Each in-memory connection is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self, table: &str) -> StoreResult<()> {
        let table = checked_table_name(table)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL,
                source TEXT NOT NULL,
                product_url TEXT NOT NULL,
                image_url TEXT NOT NULL DEFAULT '',
                brand TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                category TEXT,
                gender TEXT NOT NULL,
                price REAL,
                currency TEXT NOT NULL,
                size TEXT,
                second_hand BOOLEAN NOT NULL DEFAULT 0,
                embedding TEXT,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (id, source),
                UNIQUE (source, product_url)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_missing_embedding ON {table} (source) WHERE embedding IS NULL"
        ))
        .execute(&self.pool)
        .await?;

        info!("SQLite schema ready (table: {})", table);
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only identifiers are accepted.
fn checked_table_name(table: &str) -> StoreResult<&str> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(table)
    } else {
        Err(StoreError::Rejected {
            status: 400,
            body: format!("invalid table name '{table}'"),
        })
    }
}

#[derive(Clone)]
pub struct SqliteProductStore {
    pool: Arc<SqlitePool>,
    table: String,
}

impl SqliteProductStore {
    /// Open (and migrate) the store at `database_url`.
    pub async fn connect(database_url: &str, table: &str) -> StoreResult<Self> {
        let connection = DatabaseConnection::new(database_url).await?;
        connection.migrate(table).await?;
        Ok(Self::new(connection.pool().clone(), table))
    }

    pub fn new(pool: SqlitePool, table: &str) -> Self {
        Self {
            pool: Arc::new(pool),
            table: table.to_string(),
        }
    }

    /// Insert-or-update on either identity. Every column is overwritten except
    /// `embedding`, which an upsert without a vector leaves in place.
    fn upsert_sql(&self) -> String {
        let t = &self.table;
        let assignments = format!(
            r#"
                id = excluded.id,
                product_url = excluded.product_url,
                image_url = excluded.image_url,
                brand = excluded.brand,
                title = excluded.title,
                description = excluded.description,
                category = excluded.category,
                gender = excluded.gender,
                price = excluded.price,
                currency = excluded.currency,
                size = excluded.size,
                second_hand = excluded.second_hand,
                embedding = COALESCE(excluded.embedding, {t}.embedding),
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at"#
        );
        format!(
            r#"
            INSERT INTO {t}
            (id, source, product_url, image_url, brand, title, description, category, gender,
             price, currency, size, second_hand, embedding, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id, source) DO UPDATE SET {assignments}
            ON CONFLICT(source, product_url) DO UPDATE SET {assignments}
            "#
        )
    }

    async fn write_row<'e, E>(&self, executor: E, sql: &str, product: &ProductRecord) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row = product.to_row();
        let embedding = row.embedding.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&row.metadata)?;

        sqlx::query(sql)
            .bind(&row.id)
            .bind(&row.source)
            .bind(&row.product_url)
            .bind(&row.image_url)
            .bind(&row.brand)
            .bind(&row.title)
            .bind(&row.description)
            .bind(&row.category)
            .bind(&row.gender)
            .bind(row.price)
            .bind(&row.currency)
            .bind(&row.size)
            .bind(row.second_hand)
            .bind(embedding)
            .bind(metadata)
            .bind(row.created_at)
            .bind(Utc::now())
            .execute(executor)
            .await?;
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> StoreResult<ProductRecord> {
        let embedding: Option<String> = row.try_get("embedding")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        let stored = ProductRow {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            product_url: row.try_get("product_url")?,
            image_url: row.try_get("image_url")?,
            brand: row.try_get("brand")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            gender: row.try_get("gender")?,
            price: row.try_get("price")?,
            currency: row.try_get("currency")?,
            size: row.try_get("size")?,
            second_hand: row.try_get("second_hand")?,
            embedding: embedding.as_deref().map(serde_json::from_str).transpose()?,
            metadata: serde_json::from_str(&metadata)?,
            created_at,
        };
        Ok(stored.into_record())
    }

    /// Fetch one stored record.
    pub async fn find(&self, source: &str, product_url: &str) -> StoreResult<Option<ProductRecord>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE source = ? AND product_url = ?",
            self.table
        ))
        .bind(source)
        .bind(product_url)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| StoreError::connection(format!("SQLite store unavailable: {e}")))?;
        Ok(())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()> {
        let sql = self.upsert_sql();
        self.write_row(&*self.pool, &sql, product).await?;
        debug!("Upserted {} ({})", product.id, product.product_url);
        Ok(())
    }

    async fn upsert_products_batch(&self, products: &[ProductRecord]) -> StoreResult<BatchWriteReport> {
        let sql = self.upsert_sql();
        let mut tx = self.pool.begin().await?;
        let mut report = BatchWriteReport::default();

        for product in products {
            match self.write_row(&mut *tx, &sql, product).await {
                Ok(()) => report.written += 1,
                Err(e) => report.failed.push((product.product_url.clone(), e.to_string())),
            }
        }

        tx.commit().await?;
        debug!("Batch upsert: {} written, {} failed", report.written, report.failed_count());
        Ok(report)
    }

    async fn product_exists(&self, source: &str, product_url: &str) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE source = ? AND product_url = ?",
            self.table
        ))
        .bind(source)
        .bind(product_url)
        .fetch_one(&*self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn count_products(&self, source: &str) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE source = ?", self.table))
            .bind(source)
            .fetch_one(&*self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn products_without_embeddings(&self, source: &str, limit: usize) -> StoreResult<Vec<ProductRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE source = ? AND embedding IS NULL ORDER BY created_at LIMIT ?",
            self.table
        ))
        .bind(source)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
