//! Configuration infrastructure
//!
//! Configuration is layered, lowest priority first:
//! 1. Built-in defaults (see [`defaults`])
//! 2. Optional configuration file (TOML/YAML/JSON by extension)
//! 3. `HARVESTER__SECTION__KEY` environment variables
//! 4. `SUPABASE_URL` / `SUPABASE_ANON_KEY` credentials

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::retry_policy::{Backoff, RetryPolicy};

/// Environment prefix for layered overrides
pub const ENV_PREFIX: &str = "HARVESTER";

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub brand: BrandConfig,
    pub scraping: ScrapingConfig,
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingConfig,
    pub logging: LoggingConfig,
}

/// Retailer being harvested
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrandConfig {
    /// Brand name written on every record
    pub name: String,
    /// Source tag; part of the product id and the upsert key
    pub source: String,
    pub base_url: String,
    /// Category roots walked by `run` when none are given on the command line
    pub category_urls: Vec<String>,
    pub currency: String,
    /// Gender hint applied to every product (inferred from the URL when unset)
    pub gender: Option<String>,
    pub second_hand: bool,
    /// Category used when no breadcrumb is found
    pub default_category: Option<String>,
}

impl Default for BrandConfig {
    fn default() -> Self {
        Self {
            name: defaults::BRAND_NAME.to_string(),
            source: defaults::SOURCE_NAME.to_string(),
            base_url: defaults::BASE_URL.to_string(),
            category_urls: vec![defaults::CATEGORY_URL.to_string()],
            currency: defaults::CURRENCY.to_string(),
            gender: None,
            second_hand: false,
            default_category: None,
        }
    }
}

/// How page HTML is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageSourceKind {
    /// Headless Chromium over CDP; required for client-rendered listings
    #[default]
    Browser,
    /// Plain HTTP GET; enough for server-rendered sites
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub page_source: PageSourceKind,
    pub headless: bool,
    /// Concurrent product page loads
    pub max_concurrent_pages: usize,
    /// Fixed pause after each product page load
    pub request_delay_ms: u64,
    pub requests_per_second: u32,
    pub timeout_ms: u64,
    pub max_pages_per_category: u32,
    /// Scroll passes on listing pages to trigger lazy loading
    pub scroll_passes: u32,
    /// Load-more button clicks per listing page in the browser (0 disables)
    pub load_more_clicks: u32,
    pub retry: RetryConfig,
    pub user_agent: String,
    pub selectors: SelectorConfig,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            page_source: PageSourceKind::default(),
            headless: true,
            max_concurrent_pages: defaults::MAX_CONCURRENT_PAGES,
            request_delay_ms: defaults::REQUEST_DELAY_MS,
            requests_per_second: defaults::REQUESTS_PER_SECOND,
            timeout_ms: defaults::TIMEOUT_MS,
            max_pages_per_category: defaults::MAX_PAGES_PER_CATEGORY,
            scroll_passes: defaults::SCROLL_PASSES,
            load_more_clicks: defaults::LOAD_MORE_CLICKS,
            retry: RetryConfig::default(),
            user_agent: defaults::USER_AGENT.to_string(),
            selectors: SelectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `1.0` means a fixed delay
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_ATTEMPTS,
            base_delay_ms: defaults::RETRY_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let backoff = if self.backoff_factor <= 1.0 {
            Backoff::Fixed
        } else {
            Backoff::Exponential {
                factor: self.backoff_factor,
            }
        };
        RetryPolicy::new(self.max_attempts, self.base_delay_ms, self.max_delay_ms, backoff).with_jitter(self.jitter)
    }
}

/// Ordered fallback CSS selectors. The first selector that matches wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub product_link: Vec<String>,
    /// Path fragments that mark an href as a product page
    pub product_path_markers: Vec<String>,
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub image: Vec<String>,
    pub description: Vec<String>,
    pub sizes: Vec<String>,
    pub category: Vec<String>,
    pub next_page: Vec<String>,
    pub load_more: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        fn owned(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| (*s).to_string()).collect()
        }

        Self {
            product_link: owned(&["a[href*=\"/p/\"]", "[data-testid*=\"product\"] a[href]", ".product-card a[href]"]),
            product_path_markers: owned(&["/p/"]),
            title: owned(&[
                "h1[data-testid=\"product-title\"]",
                "h1.product-title",
                "[data-testid=\"product-name\"]",
                ".product-name",
                "h1",
            ]),
            price: owned(&[
                "[data-testid=\"product-price\"]",
                ".product-price",
                "[data-testid=\"price\"]",
                ".price",
                "[class*=\"price\"]",
            ]),
            image: owned(&[
                "img[data-testid=\"product-image\"]",
                "img.product-image",
                ".product-image img",
                ".product-gallery img",
            ]),
            description: owned(&[
                "[data-testid=\"product-description\"]",
                ".product-description",
                ".product-details",
                ".description",
                "[class*=\"description\"]",
            ]),
            sizes: owned(&["[data-testid=\"size-selector\"]", ".size-selector", ".product-sizes"]),
            category: owned(&["nav.breadcrumb", "ol.breadcrumb", "[class*=\"breadcrumb\"]"]),
            next_page: owned(&[
                "[data-testid=\"pagination-next\"]",
                "a[rel=\"next\"]",
                ".pagination-next",
                ".next-page",
                "a[aria-label*=\"next\" i]",
                "button[aria-label*=\"next\" i]",
            ]),
            load_more: owned(&["[data-testid=\"load-more\"]", ".load-more", ".show-more"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Supabase,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    /// Project base URL (`https://<ref>.supabase.co`)
    pub url: Option<String>,
    pub key: Option<String>,
    pub table_name: String,
    pub batch_size: usize,
    pub sqlite_path: PathBuf,
    pub timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key: None,
            table_name: defaults::TABLE_NAME.to_string(),
            batch_size: defaults::DB_BATCH_SIZE,
            sqlite_path: PathBuf::from(defaults::SQLITE_PATH),
            timeout_ms: defaults::TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// `sqlite://` connection string for the local mirror
    pub fn sqlite_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.sqlite_path.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    /// Inference endpoint accepting raw image bytes
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model_name: String,
    pub dimensions: usize,
    /// Images embedded concurrently
    pub batch_size: usize,
    /// Downloaded image cache; disabled when unset
    pub cache_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: defaults::EMBEDDING_ENDPOINT.to_string(),
            api_key: None,
            model_name: defaults::EMBEDDING_MODEL.to_string(),
            dimensions: defaults::EMBEDDING_DIMENSIONS,
            batch_size: defaults::EMBEDDING_BATCH_SIZE,
            cache_dir: dirs::cache_dir().map(|dir| dir.join("product-harvester").join("images")),
            timeout_ms: defaults::EMBEDDING_TIMEOUT_MS,
            max_retries: defaults::RETRY_ATTEMPTS,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    pub file_name: String,
    /// Rotated log files kept on disk
    pub max_files: u32,
    /// Extra per-target levels, e.g. `chromiumoxide = "debug"`
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: PathBuf::from("logs"),
            file_name: "product-harvester.log".to_string(),
            max_files: 7,
            module_filters: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load layered configuration.
    ///
    /// With `path == None` the default file is read when present; an explicit
    /// path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load_layers(path)?;
        config.apply_credentials(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn load_layers(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(defaults::CONFIG_PATH), false),
        };
        debug!("Loading configuration (file: {:?}, required: {})", file, required);

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("brand.category_urls"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        if file.exists() {
            info!("Loaded configuration from: {:?}", file);
        }
        Ok(config)
    }

    /// Fill database credentials from the conventional variables when present.
    pub fn apply_credentials<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SUPABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_ANON_KEY").filter(|v| !v.trim().is_empty()) {
            self.database.key = Some(key);
        }
    }

    /// Validate configuration for a run.
    ///
    /// Credentials are only required when the run writes to the hosted store.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.brand.source.trim().is_empty() {
            return Err(ConfigError::validation("brand.source must not be empty"));
        }
        if self.brand.category_urls.is_empty() {
            return Err(ConfigError::validation("at least one category URL is required"));
        }
        for url in &self.brand.category_urls {
            url::Url::parse(url)
                .map_err(|e| ConfigError::validation(format!("invalid category URL '{url}': {e}")))?;
        }
        if self.scraping.max_concurrent_pages == 0 {
            return Err(ConfigError::validation("scraping.max_concurrent_pages must be at least 1"));
        }
        if self.scraping.requests_per_second == 0 {
            return Err(ConfigError::validation("scraping.requests_per_second must be at least 1"));
        }
        if self.scraping.retry.max_attempts == 0 {
            return Err(ConfigError::validation("scraping.retry.max_attempts must be at least 1"));
        }
        if self.database.batch_size == 0 {
            return Err(ConfigError::validation("database.batch_size must be at least 1"));
        }
        if self.embeddings.dimensions == 0 {
            return Err(ConfigError::validation("embeddings.dimensions must be greater than 0"));
        }
        if self.embeddings.batch_size == 0 {
            return Err(ConfigError::validation("embeddings.batch_size must be at least 1"));
        }

        if !dry_run && self.database.backend == StoreBackend::Supabase {
            let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
            if !has(&self.database.url) || !has(&self.database.key) {
                return Err(ConfigError::validation(
                    "database url and key are required (set SUPABASE_URL and SUPABASE_ANON_KEY)",
                ));
            }
        }

        Ok(())
    }
}

/// Default configuration values
pub mod defaults {
    /// Default configuration file location
    pub const CONFIG_PATH: &str = "config/harvester.toml";

    pub const BRAND_NAME: &str = "Abercrombie & Fitch";
    pub const SOURCE_NAME: &str = "scraper";
    pub const BASE_URL: &str = "https://www.abercrombie.com";
    pub const CATEGORY_URL: &str = "https://www.abercrombie.com/shop/eu/mens";
    pub const CURRENCY: &str = "EUR";

    /// Default maximum concurrent product page loads
    pub const MAX_CONCURRENT_PAGES: usize = 3;

    /// Default delay between product loads in milliseconds
    pub const REQUEST_DELAY_MS: u64 = 1000;

    pub const REQUESTS_PER_SECOND: u32 = 2;

    /// Default page load timeout in milliseconds
    pub const TIMEOUT_MS: u64 = 30_000;

    /// Safety limit on listing pages walked per category
    pub const MAX_PAGES_PER_CATEGORY: u32 = 20;

    pub const SCROLL_PASSES: u32 = 3;

    pub const LOAD_MORE_CLICKS: u32 = 10;

    /// Default retry attempts for failed page loads
    pub const RETRY_ATTEMPTS: u32 = 3;

    /// Default retry delay in milliseconds
    pub const RETRY_DELAY_MS: u64 = 2000;

    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

    pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    pub const TABLE_NAME: &str = "products";
    pub const DB_BATCH_SIZE: usize = 50;
    pub const SQLITE_PATH: &str = "data/products.db";

    pub const EMBEDDING_ENDPOINT: &str = "http://localhost:8080/embed";
    pub const EMBEDDING_MODEL: &str = "google/siglip-base-patch16-384";
    pub const EMBEDDING_DIMENSIONS: usize = 768;
    pub const EMBEDDING_BATCH_SIZE: usize = 8;
    pub const EMBEDDING_TIMEOUT_MS: u64 = 60_000;

    /// Default `--max-products` cap
    pub const MAX_PRODUCTS: usize = 50;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid_for_dry_run() {
        let config = AppConfig::default();
        assert!(config.validate(true).is_ok());
        assert_eq!(config.embeddings.dimensions, 768);
        assert_eq!(config.scraping.max_concurrent_pages, 3);
    }

    #[test]
    fn test_live_run_requires_credentials() {
        let mut config = AppConfig::default();
        assert!(matches!(config.validate(false), Err(ConfigError::Validation { .. })));

        config.apply_credentials(|name| match name {
            "SUPABASE_URL" => Some("https://example.supabase.co".to_string()),
            "SUPABASE_ANON_KEY" => Some("anon".to_string()),
            _ => None,
        });
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_sqlite_backend_needs_no_credentials() {
        let mut config = AppConfig::default();
        config.database.backend = StoreBackend::Sqlite;
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.scraping.max_concurrent_pages = 0;
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[brand]
source = "shop"
category_urls = ["https://shop.example.com/womens"]

[scraping]
page_source = "http"
max_concurrent_pages = 5

[database]
backend = "sqlite"
"#
        )
        .unwrap();

        let config = AppConfig::load_layers(Some(file.path())).unwrap();
        assert_eq!(config.brand.source, "shop");
        assert_eq!(config.brand.currency, "EUR");
        assert_eq!(config.scraping.page_source, PageSourceKind::Http);
        assert_eq!(config.scraping.max_concurrent_pages, 5);
        assert_eq!(config.scraping.retry.max_attempts, 3);
        assert_eq!(config.database.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = AppConfig::load_layers(Some(Path::new("/nonexistent/harvester.toml")));
        assert!(matches!(result, Err(ConfigError::FileLoad { .. })));
    }

    #[test]
    fn test_retry_config_maps_to_policy() {
        let fixed = RetryConfig {
            backoff_factor: 1.0,
            jitter: false,
            ..RetryConfig::default()
        }
        .to_policy();
        assert_eq!(fixed.backoff, Backoff::Fixed);
        assert_eq!(fixed.max_attempts, 3);
    }
}
