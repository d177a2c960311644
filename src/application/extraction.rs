//! Product extraction
//!
//! Loads a product page, parses its attributes and maps them into a
//! [`ProductRecord`]. Only the title is required; every other field falls back
//! to an empty value so a partially-rendered page still yields a record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scraper::Html;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::application::pipeline::{PipelineError, Stage};
use crate::domain::{Gender, ProductId, ProductRecord, ProductUrl};
use crate::infrastructure::config::BrandConfig;
use crate::infrastructure::page_source::{PageKind, PageLoadError, PageSource};
use crate::infrastructure::parsing::{ContextualParser, ParsedProduct, ParsingError, ProductContext, ProductPageParser};
use crate::infrastructure::retry_policy::RetryPolicy;

/// Result of extracting one product page
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Record(ProductRecord),
    /// The page loaded but is not a usable product (e.g. no title)
    Skip { url: String, reason: String },
}

impl Extraction {
    pub fn into_record(self) -> Option<ProductRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Skip { .. } => None,
        }
    }
}

pub struct ProductExtractor {
    page_source: Arc<dyn PageSource>,
    parser: Arc<ProductPageParser>,
    brand: BrandConfig,
    retry: RetryPolicy,
    request_delay: Duration,
}

impl ProductExtractor {
    pub fn new(
        page_source: Arc<dyn PageSource>,
        parser: Arc<ProductPageParser>,
        brand: BrandConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            page_source,
            parser,
            brand,
            retry,
            request_delay: Duration::ZERO,
        }
    }

    /// Pause before every product page load.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Source tag written on every record.
    pub fn source(&self) -> &str {
        &self.brand.source
    }

    pub async fn extract(&self, product_url: &ProductUrl) -> Result<Extraction, PipelineError> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let url = product_url.url.as_str();
        let html = self
            .retry
            .run_if("product page load", PageLoadError::is_retryable, |_| {
                self.page_source.load(url, PageKind::Product)
            })
            .await
            .map_err(|e| PipelineError::PageLoad {
                url: url.to_string(),
                stage: Stage::Extraction,
                reason: e.to_string(),
            })?;

        match self.parse(&html, url) {
            Ok(parsed) => {
                let record = self.to_record(product_url, parsed);
                debug!("Extracted '{}' ({:?} {})", record.title, record.price, record.currency);
                Ok(Extraction::Record(record))
            }
            Err(e @ ParsingError::RequiredFieldMissing { .. }) => {
                warn!(url = %url, stage = "extraction", "Skipping product: {}", e);
                Ok(Extraction::Skip {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(PipelineError::Extraction {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn parse(&self, html: &str, url: &str) -> Result<ParsedProduct, ParsingError> {
        let document = Html::parse_document(html);
        let context = ProductContext::new(url).with_default_currency(self.brand.currency.clone());
        self.parser.parse_with_context(&document, &context)
    }

    fn to_record(&self, product_url: &ProductUrl, parsed: ParsedProduct) -> ProductRecord {
        let url = product_url.url.as_str();

        let hint = parsed.gender_hint.as_deref().or(self.brand.gender.as_deref());
        let gender = match Gender::infer(hint, url) {
            Gender::Other if !product_url.category_url.is_empty() => Gender::infer(None, &product_url.category_url),
            gender => gender,
        };

        let category = parsed
            .category
            .or_else(|| self.brand.default_category.clone())
            .or_else(|| category_from_url(&product_url.category_url));

        let mut metadata = parsed.metadata;
        if !product_url.category_url.is_empty() {
            metadata.insert("category_url".into(), Value::from(product_url.category_url.clone()));
            metadata.insert("listing_page".into(), Value::from(product_url.page_number));
            metadata.insert("listing_index".into(), Value::from(product_url.index_in_page));
        }

        ProductRecord {
            id: ProductId::from_url(&self.brand.source, url),
            source: self.brand.source.clone(),
            product_url: url.to_string(),
            image_url: parsed.image_url,
            image_urls: parsed.image_urls,
            brand: self.brand.name.clone(),
            title: parsed.title,
            description: parsed.description,
            category,
            gender,
            price: parsed.price,
            currency: parsed.currency.unwrap_or_else(|| self.brand.currency.clone()),
            sizes: parsed.sizes,
            second_hand: self.brand.second_hand,
            embedding: None,
            metadata: Value::Object(metadata),
            created_at: Utc::now(),
        }
    }
}

/// Last path segment of a category URL (`.../shop/eu/mens` -> `mens`).
fn category_from_url(category_url: &str) -> Option<String> {
    let url = Url::parse(category_url).ok()?;
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::page_source::fixtures::StaticPageSource;
    use crate::infrastructure::retry_policy::Backoff;

    const PRODUCT: &str = "https://shop.example.com/shop/eu/p/linen-shirt-58231";
    const CATEGORY: &str = "https://shop.example.com/shop/eu/mens";

    fn extractor(source: StaticPageSource) -> ProductExtractor {
        let brand = BrandConfig {
            name: "Example".to_string(),
            source: "scraper".to_string(),
            ..BrandConfig::default()
        };
        ProductExtractor::new(
            Arc::new(source),
            Arc::new(ProductPageParser::new().unwrap()),
            brand,
            RetryPolicy::new(2, 1, 1, Backoff::Fixed),
        )
    }

    #[tokio::test]
    async fn test_extracts_record_with_listing_context() {
        let html = r#"<html><head><title>Linen Shirt | Example</title></head><body>
            <h1 class="product-title">Linen Shirt</h1>
            <span class="product-price">€45,90</span>
            <img class="product-image" src="/img/linen.jpg">
        </body></html>"#;
        let source = StaticPageSource::default().with_page(PRODUCT, html);
        let url = ProductUrl::new(PRODUCT.to_string(), CATEGORY.to_string(), 2, 5);

        let record = extractor(source).extract(&url).await.unwrap().into_record().unwrap();

        assert_eq!(record.id.as_str(), "scraper_linen-shirt-58231");
        assert_eq!(record.title, "Linen Shirt");
        assert_eq!(record.price, Some(45.9));
        assert_eq!(record.currency, "EUR");
        assert_eq!(record.gender, Gender::Man);
        assert_eq!(record.category.as_deref(), Some("mens"));
        assert_eq!(record.image_url.as_deref(), Some("https://shop.example.com/img/linen.jpg"));
        assert_eq!(record.metadata["listing_page"], 2);
        assert_eq!(record.brand, "Example");
    }

    #[tokio::test]
    async fn test_missing_price_still_produces_record() {
        let html = "<html><body><h1>Canvas Tote</h1></body></html>";
        let source = StaticPageSource::default().with_page(PRODUCT, html);

        let extraction = extractor(source).extract(&ProductUrl::standalone(PRODUCT)).await.unwrap();
        let Extraction::Record(record) = extraction else {
            panic!("expected a record");
        };
        assert_eq!(record.title, "Canvas Tote");
        assert_eq!(record.price, None);
        assert!(record.sizes.is_empty());
        assert_eq!(record.gender, Gender::Other);
    }

    #[tokio::test]
    async fn test_missing_title_is_skipped() {
        let source = StaticPageSource::default().with_page(PRODUCT, "<html><body><div>loading</div></body></html>");
        let extraction = extractor(source).extract(&ProductUrl::standalone(PRODUCT)).await.unwrap();
        assert!(matches!(extraction, Extraction::Skip { ref url, .. } if url == PRODUCT));
    }

    #[tokio::test]
    async fn test_load_failure_reports_stage_and_url() {
        let err = extractor(StaticPageSource::default())
            .extract(&ProductUrl::standalone(PRODUCT))
            .await
            .unwrap_err();
        match err {
            PipelineError::PageLoad { url, stage, .. } => {
                assert_eq!(url, PRODUCT);
                assert_eq!(stage, Stage::Extraction);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_category_from_url() {
        assert_eq!(category_from_url(CATEGORY).as_deref(), Some("mens"));
        assert_eq!(category_from_url("https://x.com/shop/womens/").as_deref(), Some("womens"));
        assert_eq!(category_from_url(""), None);
    }
}
