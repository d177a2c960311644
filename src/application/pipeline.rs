//! Harvest pipeline: discovery → extraction → embedding → persistence
//!
//! Categories are walked one at a time. Product pages are extracted with
//! bounded concurrency, grouped into batches, embedded and upserted. Only a
//! fatal store error aborts a run; every other failure is logged with its
//! stage and URL, counted, and the run moves on.

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::discovery::{CategoryDiscovery, DiscoveryLimits};
use crate::application::extraction::{Extraction, ProductExtractor};
use crate::domain::{ProductRecord, ProductStore, StoreError, VisitedUrls};
use crate::infrastructure::config::{AppConfig, defaults};
use crate::infrastructure::embedding::ImageEmbedder;
use crate::infrastructure::page_source::PageSource;
use crate::infrastructure::parsing::ListingParser;

/// Pipeline stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discovery,
    Extraction,
    Embedding,
    Persistence,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovery => "discovery",
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::Persistence => "persistence",
        })
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load {url} during {stage}: {reason}")]
    PageLoad { url: String, stage: Stage, reason: String },

    #[error("Failed to extract {url}: {reason}")]
    Extraction { url: String, reason: String },

    #[error("Fatal store error: {0}")]
    Fatal(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Config(_))
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub categories: usize,
    /// Product URLs handed to extraction
    pub discovered: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub page_failures: usize,
    pub embedded: usize,
    pub embedding_failures: usize,
    pub saved: usize,
    pub write_failures: usize,
    pub dry_run: bool,
    pub interrupted: bool,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "categories={} discovered={} extracted={} skipped={} page_failures={} embedded={} embedding_failures={} saved={} write_failures={}{}{}",
            self.categories,
            self.discovered,
            self.extracted,
            self.skipped,
            self.page_failures,
            self.embedded,
            self.embedding_failures,
            self.saved,
            self.write_failures,
            if self.dry_run { " (dry run)" } else { "" },
            if self.interrupted { " (interrupted)" } else { "" },
        )
    }
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub stats: RunStats,
    /// Extracted records, kept only when `collect_records` is set
    pub records: Vec<ProductRecord>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub dry_run: bool,
    /// Cap on product URLs extracted across all categories
    pub max_products: Option<usize>,
    pub collect_records: bool,
    pub batch_size: usize,
    pub max_concurrent_pages: usize,
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_products: None,
            collect_records: false,
            batch_size: defaults::DB_BATCH_SIZE,
            max_concurrent_pages: defaults::MAX_CONCURRENT_PAGES,
            show_progress: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.database.batch_size,
            max_concurrent_pages: config.scraping.max_concurrent_pages,
            ..Self::default()
        }
    }
}

pub struct Pipeline {
    page_source: Arc<dyn PageSource>,
    listing_parser: Arc<ListingParser>,
    extractor: ProductExtractor,
    discovery_limits: DiscoveryLimits,
    embedder: Option<Arc<dyn ImageEmbedder>>,
    store: Option<Arc<dyn ProductStore>>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        page_source: Arc<dyn PageSource>,
        listing_parser: Arc<ListingParser>,
        extractor: ProductExtractor,
        options: PipelineOptions,
    ) -> Self {
        Self {
            page_source,
            listing_parser,
            extractor,
            discovery_limits: DiscoveryLimits::default(),
            embedder: None,
            store: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProductStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn ImageEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_discovery_limits(mut self, limits: DiscoveryLimits) -> Self {
        self.discovery_limits = limits;
        self
    }

    /// Token that stops discovery when cancelled; in-flight pages still finish.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn store(&self) -> Result<&Arc<dyn ProductStore>, PipelineError> {
        self.store
            .as_ref()
            .ok_or_else(|| PipelineError::Config("no product store configured".to_string()))
    }

    /// Harvest every category in `categories`.
    pub async fn run(&self, categories: &[String]) -> Result<RunOutcome, PipelineError> {
        let mut outcome = RunOutcome::default();
        outcome.stats.dry_run = self.options.dry_run;

        if self.options.dry_run {
            info!("🧪 Dry run: nothing will be written");
        } else {
            self.store()?.health_check().await?;
            info!("✅ Product store reachable");
        }

        let progress = self.progress_bar();
        let mut visited = VisitedUrls::new();

        for category in categories {
            if self.cancel.is_cancelled() || self.cap_reached(&outcome.stats) {
                break;
            }
            info!("🚀 Harvesting category {}", category);
            outcome.stats.categories += 1;
            self.run_category(category, &mut visited, &mut outcome, &progress).await?;
        }

        progress.finish_and_clear();
        outcome.stats.interrupted = self.cancel.is_cancelled();
        info!("🎯 Run finished: {}", outcome.stats);
        Ok(outcome)
    }

    fn cap_reached(&self, stats: &RunStats) -> bool {
        self.options.max_products.is_some_and(|cap| stats.discovered >= cap)
    }

    async fn run_category(
        &self,
        category_url: &str,
        visited: &mut VisitedUrls,
        outcome: &mut RunOutcome,
        progress: &ProgressBar,
    ) -> Result<(), PipelineError> {
        let remaining = self
            .options
            .max_products
            .map_or(usize::MAX, |cap| cap.saturating_sub(outcome.stats.discovered));

        let discovered = AtomicUsize::new(0);
        let page_failures = AtomicUsize::new(0);

        let discovery = CategoryDiscovery::new(
            self.page_source.clone(),
            self.listing_parser.clone(),
            category_url,
            self.discovery_limits.clone(),
        );

        let urls = discovery
            .into_stream(visited)
            .filter_map(|item| {
                let page_failures = &page_failures;
                async move {
                    match item {
                        Ok(url) => Some(url),
                        Err(e) => {
                            warn!("{}", e);
                            page_failures.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                    }
                }
            })
            .take(remaining)
            .take_until(self.cancel.cancelled())
            .inspect(|_| {
                discovered.fetch_add(1, Ordering::Relaxed);
            });

        let batches = urls
            .map(|url| async move {
                let result = self.extractor.extract(&url).await;
                progress.inc(1);
                result
            })
            .buffer_unordered(self.options.max_concurrent_pages.max(1))
            .chunks(self.options.batch_size.max(1));
        let mut batches = pin!(batches);

        while let Some(batch) = batches.next().await {
            let mut records = Vec::with_capacity(batch.len());
            for result in batch {
                match result {
                    Ok(Extraction::Record(record)) => {
                        outcome.stats.extracted += 1;
                        records.push(record);
                    }
                    Ok(Extraction::Skip { .. }) => outcome.stats.skipped += 1,
                    Err(e @ PipelineError::PageLoad { .. }) => {
                        warn!("{}", e);
                        outcome.stats.page_failures += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("{}", e);
                        outcome.stats.skipped += 1;
                    }
                }
            }
            self.process_batch(records, outcome).await?;
        }

        outcome.stats.discovered += discovered.load(Ordering::Relaxed);
        outcome.stats.page_failures += page_failures.load(Ordering::Relaxed);
        Ok(())
    }

    async fn process_batch(&self, records: Vec<ProductRecord>, outcome: &mut RunOutcome) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }

        let records = self.embed_records(records, &mut outcome.stats).await;

        if self.options.dry_run {
            debug!("Dry run: skipping write of {} records", records.len());
        } else {
            self.persist(&records, &mut outcome.stats).await?;
        }

        if self.options.collect_records {
            outcome.records.extend(records);
        }
        Ok(())
    }

    /// Attach embeddings; a failed image leaves its record without a vector.
    async fn embed_records(&self, records: Vec<ProductRecord>, stats: &mut RunStats) -> Vec<ProductRecord> {
        let Some(embedder) = &self.embedder else {
            return records;
        };

        let image_urls: Vec<String> = records.iter().filter_map(|r| r.image_url.clone()).collect();
        if image_urls.is_empty() {
            return records;
        }

        let results = embedder.embed_batch(&image_urls).await;
        let mut embedded = Vec::with_capacity(records.len());
        for record in records {
            match record.image_url.as_deref().and_then(|url| results.get(url)) {
                Some(Ok(vector)) => {
                    stats.embedded += 1;
                    embedded.push(record.with_embedding(vector.clone()));
                }
                Some(Err(e)) => {
                    warn!(url = %record.product_url, stage = %Stage::Embedding, "Embedding failed, saving without vector: {}", e);
                    stats.embedding_failures += 1;
                    embedded.push(record);
                }
                None => embedded.push(record),
            }
        }
        embedded
    }

    async fn persist(&self, records: &[ProductRecord], stats: &mut RunStats) -> Result<(), PipelineError> {
        match self.store()?.upsert_products_batch(records).await {
            Ok(report) => {
                stats.saved += report.written;
                stats.write_failures += report.failed_count();
                for (url, reason) in &report.failed {
                    warn!(url = %url, stage = %Stage::Persistence, "Write failed: {}", reason);
                }
                info!("💾 Saved {} products ({} failed)", report.written, report.failed_count());
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(PipelineError::Fatal(e)),
            Err(e) => {
                warn!(stage = %Stage::Persistence, "Batch of {} failed: {}", records.len(), e);
                stats.write_failures += records.len();
                Ok(())
            }
        }
    }

    /// Embed stored products that have no vector yet.
    pub async fn backfill_embeddings(&self, limit: usize) -> Result<RunStats, PipelineError> {
        let store = self.store()?;
        if self.embedder.is_none() {
            return Err(PipelineError::Config("embeddings are disabled".to_string()));
        }

        let mut stats = RunStats {
            dry_run: self.options.dry_run,
            ..RunStats::default()
        };

        store.health_check().await?;
        let pending = store
            .products_without_embeddings(self.extractor.source(), limit)
            .await?;
        info!("🔄 {} products without embeddings", pending.len());
        stats.discovered = pending.len();

        for chunk in pending.chunks(self.options.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                stats.interrupted = true;
                break;
            }
            let embedded: Vec<ProductRecord> = self
                .embed_records(chunk.to_vec(), &mut stats)
                .await
                .into_iter()
                .filter(ProductRecord::has_embedding)
                .collect();

            if !self.options.dry_run && !embedded.is_empty() {
                self.persist(&embedded, &mut stats).await?;
            }
        }

        info!("🎯 Backfill finished: {}", stats);
        Ok(stats)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let bar = match self.options.max_products {
            Some(cap) => ProgressBar::new(cap as u64),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}) {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(250));
        bar
    }
}
