//! Application layer module
//!
//! Use cases that drive the harvest: category discovery, product extraction
//! and the pipeline that embeds and persists the results.

pub mod discovery;
pub mod extraction;
pub mod pipeline;

pub use discovery::{CategoryDiscovery, DiscoveredPage, DiscoveryLimits};
pub use extraction::{Extraction, ProductExtractor};
pub use pipeline::{Pipeline, PipelineError, PipelineOptions, RunOutcome, RunStats, Stage};
