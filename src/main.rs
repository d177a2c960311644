use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use product_harvester::application::{
    CategoryDiscovery, DiscoveryLimits, Pipeline, PipelineOptions, ProductExtractor,
};
use product_harvester::domain::{ProductStore, ProductUrl, VisitedUrls};
use product_harvester::infrastructure::config::{AppConfig, PageSourceKind, StoreBackend, defaults};
use product_harvester::infrastructure::{
    BrowserPageSource, HttpClient, HttpClientConfig, HttpImageEmbedder, HttpPageSource, ImageEmbedder,
    ListingParser, PageSource, ProductPageParser, SqliteProductStore, SupabaseStore, init_logging,
};

#[derive(Parser)]
#[command(name = "product-harvester", version, about = "Scrape retail catalogs into a product table with image embeddings")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "HARVESTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, extract, embed and store products
    Run {
        /// Category root URL (repeatable; defaults to brand.category_urls)
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Max products across all categories (0 = no limit)
        #[arg(short = 'n', long, default_value_t = defaults::MAX_PRODUCTS)]
        max_products: usize,
        /// Run every step except writing to the store
        #[arg(long)]
        dry_run: bool,
        /// Skip image embeddings
        #[arg(long)]
        no_embeddings: bool,
    },
    /// Print the product URLs found under a category
    Discover {
        #[arg(long)]
        category: String,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Extract one product page and print the record as JSON
    Extract {
        url: String,
        /// Also compute the image embedding
        #[arg(long)]
        embed: bool,
    },
    /// Embed stored products that have no vector yet
    BackfillEmbeddings {
        #[arg(short = 'n', long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate configuration and store connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⚠️ Interrupt received, finishing in-flight pages");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Run {
            categories,
            max_products,
            dry_run,
            no_embeddings,
        } => run(config, categories, max_products, dry_run, no_embeddings, cancel).await,
        Commands::Discover { category, max_pages } => discover(config, category, max_pages).await,
        Commands::Extract { url, embed } => extract(config, url, embed).await,
        Commands::BackfillEmbeddings { limit, dry_run } => backfill(config, limit, dry_run, cancel).await,
        Commands::Check => check(config).await,
    }
}

async fn run(
    mut config: AppConfig,
    categories: Vec<String>,
    max_products: usize,
    dry_run: bool,
    no_embeddings: bool,
    cancel: CancellationToken,
) -> Result<()> {
    if !categories.is_empty() {
        config.brand.category_urls = categories;
    }
    config.validate(dry_run).context("Invalid configuration")?;

    let http = http_client(&config)?;
    let page_source = page_source(&config, http.clone(), &cancel).await?;

    let options = PipelineOptions {
        dry_run,
        max_products: (max_products > 0).then_some(max_products),
        show_progress: true,
        ..PipelineOptions::from_config(&config)
    };
    let mut pipeline = Pipeline::new(
        page_source.clone(),
        Arc::new(ListingParser::with_selectors(&config.scraping.selectors)?),
        extractor(&config, page_source.clone())?,
        options,
    )
    .with_discovery_limits(discovery_limits(&config, None))
    .with_cancellation(cancel);

    if !dry_run {
        pipeline = pipeline.with_store(store(&config).await?);
    }
    if config.embeddings.enabled && !no_embeddings {
        pipeline = pipeline.with_embedder(embedder(&config, http)?);
    }

    let result = pipeline.run(&config.brand.category_urls).await;
    page_source.shutdown().await;

    let outcome = result.context("Harvest aborted")?;
    println!("{}", outcome.stats);
    Ok(())
}

async fn discover(config: AppConfig, category: String, max_pages: Option<u32>) -> Result<()> {
    let http = http_client(&config)?;
    let page_source = page_source(&config, http, &CancellationToken::new()).await?;

    let discovery = CategoryDiscovery::new(
        page_source.clone(),
        Arc::new(ListingParser::with_selectors(&config.scraping.selectors)?),
        category,
        discovery_limits(&config, max_pages),
    );
    let mut visited = VisitedUrls::new();
    let result = discovery.collect_all(&mut visited).await;
    page_source.shutdown().await;

    for url in result.context("Discovery failed")? {
        println!("{}", url.url);
    }
    Ok(())
}

async fn extract(config: AppConfig, url: String, embed: bool) -> Result<()> {
    let http = http_client(&config)?;
    let page_source = page_source(&config, http.clone(), &CancellationToken::new()).await?;

    let result = extractor(&config, page_source.clone())?
        .extract(&ProductUrl::standalone(url.clone()))
        .await;
    page_source.shutdown().await;

    let Some(mut record) = result.context("Extraction failed")?.into_record() else {
        bail!("{url} is not a usable product page");
    };

    if embed {
        let image_url = record.image_url.clone().context("Product has no image to embed")?;
        let vector = embedder(&config, http)?
            .embed(&image_url)
            .await
            .context("Embedding failed")?;
        record = record.with_embedding(vector);
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn backfill(config: AppConfig, limit: usize, dry_run: bool, cancel: CancellationToken) -> Result<()> {
    config.validate(false).context("Invalid configuration")?;

    let http = http_client(&config)?;
    // Backfill never loads pages
    let page_source: Arc<dyn PageSource> = Arc::new(HttpPageSource::new(http.clone()));

    let pipeline = Pipeline::new(
        page_source.clone(),
        Arc::new(ListingParser::with_selectors(&config.scraping.selectors)?),
        extractor(&config, page_source)?,
        PipelineOptions {
            dry_run,
            ..PipelineOptions::from_config(&config)
        },
    )
    .with_store(store(&config).await?)
    .with_embedder(embedder(&config, http)?)
    .with_cancellation(cancel);

    let stats = pipeline.backfill_embeddings(limit).await.context("Backfill aborted")?;
    println!("{stats}");
    Ok(())
}

async fn check(config: AppConfig) -> Result<()> {
    config.validate(false).context("Invalid configuration")?;
    info!(
        "Configuration OK: {} categories, page source {:?}, store {:?}",
        config.brand.category_urls.len(),
        config.scraping.page_source,
        config.database.backend
    );

    let store = store(&config).await?;
    store.health_check().await.context("Store health check failed")?;
    let count = store.count_products(&config.brand.source).await?;
    println!("Store reachable: {count} products for source '{}'", config.brand.source);
    Ok(())
}

fn http_client(config: &AppConfig) -> Result<Arc<HttpClient>> {
    Ok(Arc::new(HttpClient::new(HttpClientConfig::from(&config.scraping))?))
}

async fn page_source(config: &AppConfig, http: Arc<HttpClient>, cancel: &CancellationToken) -> Result<Arc<dyn PageSource>> {
    Ok(match config.scraping.page_source {
        PageSourceKind::Browser => Arc::new(
            BrowserPageSource::launch(&config.scraping)
                .await
                .context("Failed to start the browser (set scraping.page_source = \"http\" to skip it)")?,
        ),
        PageSourceKind::Http => Arc::new(HttpPageSource::new(http).with_cancellation(cancel.clone())),
    })
}

fn extractor(config: &AppConfig, page_source: Arc<dyn PageSource>) -> Result<ProductExtractor> {
    Ok(ProductExtractor::new(
        page_source,
        Arc::new(ProductPageParser::with_selectors(&config.scraping.selectors)?),
        config.brand.clone(),
        config.scraping.retry.to_policy(),
    )
    .with_request_delay(Duration::from_millis(config.scraping.request_delay_ms)))
}

fn discovery_limits(config: &AppConfig, max_pages: Option<u32>) -> DiscoveryLimits {
    DiscoveryLimits {
        max_pages: max_pages.unwrap_or(config.scraping.max_pages_per_category),
        retry: config.scraping.retry.to_policy(),
    }
}

async fn store(config: &AppConfig) -> Result<Arc<dyn ProductStore>> {
    Ok(match config.database.backend {
        StoreBackend::Supabase => Arc::new(SupabaseStore::new(&config.database)?),
        StoreBackend::Sqlite => Arc::new(
            SqliteProductStore::connect(&config.database.sqlite_url(), &config.database.table_name)
                .await
                .context("Failed to open SQLite store")?,
        ),
    })
}

fn embedder(config: &AppConfig, http: Arc<HttpClient>) -> Result<Arc<dyn ImageEmbedder>> {
    Ok(Arc::new(HttpImageEmbedder::new(&config.embeddings, http)?))
}
