//! Product Harvester - retail catalog scraping pipeline
//!
//! Discovers product pages from category listings, extracts structured
//! attributes, embeds product imagery and upserts the records into a hosted
//! product table.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export the types a driver needs
pub use application::{CategoryDiscovery, Pipeline, PipelineError, PipelineOptions, ProductExtractor, RunOutcome, RunStats};
pub use domain::{Gender, ProductId, ProductRecord, ProductStore, ProductUrl, VisitedUrls};
pub use infrastructure::config::AppConfig;
