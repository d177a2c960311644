//! Infrastructure layer for configuration, page loading, parsing, embeddings and storage
//!
//! Everything that talks to the outside world (retail sites, the inference
//! endpoint, the product database) lives here behind the traits the
//! application layer depends on.

pub mod browser; // Headless Chromium page source
pub mod config;
pub mod embedding;
pub mod http_client;
pub mod logging;
pub mod page_source;
pub mod parsing;
pub mod retry_policy;
pub mod sqlite_store; // Local mirror of the products table
pub mod supabase_store;

// Re-export commonly used items
pub use browser::BrowserPageSource;
pub use config::{AppConfig, ConfigError, PageSourceKind, StoreBackend};
pub use embedding::{EmbeddingError, HttpImageEmbedder, ImageEmbedder};
pub use http_client::{FetchError, HttpClient, HttpClientConfig};
pub use logging::{cleanup_old_logs, init_logging};
pub use page_source::{HttpPageSource, PageKind, PageLoadError, PageSource};
pub use parsing::{ListingParser, ParsingError, ParsingResult, ProductPageParser};
pub use retry_policy::{Backoff, RetryPolicy};
pub use sqlite_store::{DatabaseConnection, SqliteProductStore};
pub use supabase_store::SupabaseStore;
