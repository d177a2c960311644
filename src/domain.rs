//! Domain module - product records and persistence contracts
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod product;
pub mod product_url;
pub mod repositories;
pub mod visited;

pub use product::{canonical_product_url, Gender, ProductId, ProductRecord, ProductRow};
pub use product_url::ProductUrl;
pub use repositories::{BatchWriteReport, ProductStore, StoreError, StoreResult};
pub use visited::VisitedUrls;
