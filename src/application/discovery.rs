//! Category discovery
//!
//! Walks a category's listing pages and yields product URLs. The next page is
//! always read from the current page's markup, so a walk can be restarted from
//! any listing URL without saved progress.
//!
//! When to stop is decided from the category's own pages. The run-wide
//! [`VisitedUrls`] set only filters what is emitted, so a category whose first
//! page overlaps an earlier category is still walked to the end.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use scraper::Html;
use tracing::{debug, info, warn};

use crate::application::pipeline::{PipelineError, Stage};
use crate::domain::product::canonical_product_url;
use crate::domain::{ProductUrl, VisitedUrls};
use crate::infrastructure::page_source::{PageKind, PageLoadError, PageSource};
use crate::infrastructure::parsing::{
    ContextualParser, ListingContext, ListingPage, ListingParser, ParsingError,
};
use crate::infrastructure::retry_policy::RetryPolicy;

/// Bounds for one category walk
#[derive(Debug, Clone)]
pub struct DiscoveryLimits {
    pub max_pages: u32,
    /// Applied to the first listing page only
    pub retry: RetryPolicy,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_pages: crate::infrastructure::config::defaults::MAX_PAGES_PER_CATEGORY,
            retry: RetryPolicy::default(),
        }
    }
}

/// New product URLs found on one listing page
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPage {
    pub page_url: String,
    pub page_number: u32,
    pub product_urls: Vec<ProductUrl>,
    pub next_page_url: Option<String>,
}

pub struct CategoryDiscovery {
    page_source: Arc<dyn PageSource>,
    parser: Arc<ListingParser>,
    category_url: String,
    limits: DiscoveryLimits,
    next_url: Option<String>,
    page_number: u32,
    seen_pages: HashSet<String>,
    /// Canonical product URLs listed so far in this category
    seen_products: HashSet<String>,
}

impl CategoryDiscovery {
    pub fn new(
        page_source: Arc<dyn PageSource>,
        parser: Arc<ListingParser>,
        category_url: impl Into<String>,
        limits: DiscoveryLimits,
    ) -> Self {
        let category_url = category_url.into();
        Self {
            page_source,
            parser,
            next_url: Some(category_url.clone()),
            category_url,
            limits,
            page_number: 0,
            seen_pages: HashSet::new(),
            seen_products: HashSet::new(),
        }
    }

    pub fn category_url(&self) -> &str {
        &self.category_url
    }

    /// Load the next listing page and return the product URLs not yet in `visited`.
    ///
    /// The returned page may carry no URLs when everything on it was already
    /// emitted by another category. Returns `Ok(None)` once the category is
    /// exhausted: no product links, or only products this category already
    /// listed. Only a failure to load the first page is reported as an error;
    /// later failures end the walk.
    pub async fn next_page(&mut self, visited: &mut VisitedUrls) -> Result<Option<DiscoveredPage>, PipelineError> {
        let Some(page_url) = self.next_url.take() else {
            return Ok(None);
        };
        if self.page_number >= self.limits.max_pages {
            info!(
                "Reached page limit ({}) for category {}",
                self.limits.max_pages, self.category_url
            );
            return Ok(None);
        }

        self.page_number += 1;
        let page_number = self.page_number;
        self.seen_pages.insert(page_url.clone());

        let html = match self.load(&page_url, page_number).await {
            Ok(html) => html,
            Err(e) if page_number == 1 => {
                return Err(PipelineError::PageLoad {
                    url: page_url,
                    stage: Stage::Discovery,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(url = %page_url, stage = "discovery", "Listing page {} failed, ending category: {}", page_number, e);
                return Ok(None);
            }
        };

        let listing = match self.parse(&html, &page_url, page_number) {
            Ok(listing) => listing,
            Err(ParsingError::NoProductsFound { .. }) => {
                if page_number == 1 {
                    warn!(
                        url = %page_url,
                        stage = "discovery",
                        "⚠️ No product links on the first listing page; selectors may be out of date"
                    );
                } else {
                    debug!("No product links on page {}, category finished", page_number);
                }
                return Ok(None);
            }
            Err(e) => {
                warn!(url = %page_url, stage = "discovery", "Failed to parse listing page: {}", e);
                return Ok(None);
            }
        };

        let listed: Vec<String> = listing
            .product_urls
            .iter()
            .map(|url| canonical_product_url(url))
            .filter(|url| self.seen_products.insert(url.clone()))
            .collect();
        if listed.is_empty() {
            debug!(
                "Page {} of {} only repeats products already listed, category finished",
                page_number, self.category_url
            );
            return Ok(None);
        }
        let listed_count = listed.len();
        let new_urls = visited.extend_new(listed);

        self.next_url = listing.next_page_url.filter(|next| {
            let fresh = !self.seen_pages.contains(next);
            if !fresh {
                debug!("Next page {} already visited, stopping", next);
            }
            fresh
        });

        debug!(
            "Page {} of {}: {} listed, {} new to this run, next: {:?}",
            page_number,
            self.category_url,
            listed_count,
            new_urls.len(),
            self.next_url
        );

        let product_urls = new_urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| ProductUrl::new(url, self.category_url.clone(), page_number, index as u32))
            .collect();

        Ok(Some(DiscoveredPage {
            page_url,
            page_number,
            product_urls,
            next_page_url: self.next_url.clone(),
        }))
    }

    async fn load(&self, url: &str, page_number: u32) -> Result<String, PageLoadError> {
        if page_number == 1 {
            self.limits
                .retry
                .run_if("listing page load", PageLoadError::is_retryable, |_| {
                    self.page_source.load(url, PageKind::Listing)
                })
                .await
        } else {
            self.page_source.load(url, PageKind::Listing).await
        }
    }

    fn parse(&self, html: &str, page_url: &str, page_number: u32) -> Result<ListingPage, ParsingError> {
        let document = Html::parse_document(html);
        self.parser
            .parse_with_context(&document, &ListingContext::new(page_url, page_number))
    }

    /// Product URLs of the whole category as a lazy stream.
    ///
    /// A first-page failure is yielded as a single error item.
    pub fn into_stream(self, visited: &mut VisitedUrls) -> impl Stream<Item = Result<ProductUrl, PipelineError>> + '_ {
        stream::unfold(Some((self, visited)), |state| async move {
            let (mut discovery, visited) = state?;
            match discovery.next_page(visited).await {
                Ok(Some(page)) => {
                    let items: Vec<Result<ProductUrl, PipelineError>> = page.product_urls.into_iter().map(Ok).collect();
                    Some((items, Some((discovery, visited))))
                }
                Ok(None) => None,
                Err(e) => Some((vec![Err(e)], None)),
            }
        })
        .flat_map(stream::iter)
    }

    /// Walk the whole category and collect its product URLs.
    pub async fn collect_all(self, visited: &mut VisitedUrls) -> Result<Vec<ProductUrl>, PipelineError> {
        let category = self.category_url.clone();
        let urls: Vec<ProductUrl> = self
            .into_stream(visited)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        info!("🔍 Discovered {} products in {}", urls.len(), category);
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::page_source::fixtures::StaticPageSource;
    use crate::infrastructure::retry_policy::Backoff;

    const CATEGORY: &str = "https://shop.example.com/shop/eu/mens";

    fn listing(products: &[&str], next: Option<&str>) -> String {
        let cards: String = products
            .iter()
            .map(|p| format!(r#"<li class="product-card"><a href="/shop/eu/p/{p}">{p}</a></li>"#))
            .collect();
        let pager = next
            .map(|href| format!(r#"<a rel="next" href="{href}">Next</a>"#))
            .unwrap_or_default();
        format!("<html><body><ul>{cards}</ul>{pager}</body></html>")
    }

    fn limits(max_pages: u32) -> DiscoveryLimits {
        DiscoveryLimits {
            max_pages,
            retry: RetryPolicy::new(2, 1, 1, Backoff::Fixed),
        }
    }

    fn discovery(source: StaticPageSource, max_pages: u32) -> CategoryDiscovery {
        CategoryDiscovery::new(
            Arc::new(source),
            Arc::new(ListingParser::new().unwrap()),
            CATEGORY,
            limits(max_pages),
        )
    }

    #[tokio::test]
    async fn test_collects_every_product_across_pages() {
        let source = StaticPageSource::default()
            .with_page(CATEGORY, &listing(&["a-1", "b-2", "c-3"], Some("?page=2")))
            .with_page(&format!("{CATEGORY}?page=2"), &listing(&["d-4", "e-5"], None));

        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();

        assert_eq!(urls.len(), 5);
        assert_eq!(visited.len(), 5);
        assert_eq!(urls[3].page_number, 2);
        assert_eq!(urls[3].index_in_page, 0);
        assert!(urls.iter().all(|u| u.category_url == CATEGORY));
    }

    #[tokio::test]
    async fn test_stops_on_pagination_cycle() {
        // Page 2 links back to page 1 and repeats one product
        let source = StaticPageSource::default()
            .with_page(CATEGORY, &listing(&["a-1", "b-2"], Some("?page=2")))
            .with_page(&format!("{CATEGORY}?page=2"), &listing(&["b-2", "c-3"], Some(CATEGORY)));

        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();
        assert_eq!(urls.len(), 3);
    }

    #[tokio::test]
    async fn test_page_limit_and_known_urls() {
        let source = StaticPageSource::default()
            .with_page(CATEGORY, &listing(&["a-1"], Some("?page=2")))
            .with_page(&format!("{CATEGORY}?page=2"), &listing(&["b-2"], None));

        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 1).collect_all(&mut visited).await.unwrap();
        assert_eq!(urls.len(), 1);

        // Page 1 is already known to the run: nothing is emitted but the walk goes on
        let source = StaticPageSource::default().with_page(CATEGORY, &listing(&["a-1"], Some("?page=2")));
        let mut d = discovery(source, 10);
        let page = d.next_page(&mut visited).await.unwrap().unwrap();
        assert!(page.product_urls.is_empty());
        assert_eq!(page.next_page_url.as_deref(), Some("https://shop.example.com/shop/eu/mens?page=2"));
    }

    #[tokio::test]
    async fn test_overlap_with_earlier_category_does_not_stop_walk() {
        let source = StaticPageSource::default()
            .with_page(CATEGORY, &listing(&["x-1", "x-2"], Some("?page=2")))
            .with_page(&format!("{CATEGORY}?page=2"), &listing(&["m-3", "m-4"], None));

        let mut visited = VisitedUrls::new();
        visited.insert("https://shop.example.com/shop/eu/p/x-1");
        visited.insert("https://shop.example.com/shop/eu/p/x-2?color=blue");

        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();
        let found: Vec<&str> = urls.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(
            found,
            vec!["https://shop.example.com/shop/eu/p/m-3", "https://shop.example.com/shop/eu/p/m-4"]
        );
        assert!(urls.iter().all(|u| u.page_number == 2));
    }

    #[tokio::test]
    async fn test_page_repeating_own_products_ends_walk() {
        // The site ignores the page parameter and serves page 1 again
        let source = StaticPageSource::default()
            .with_page(CATEGORY, &listing(&["a-1", "b-2"], Some("?page=2")))
            .with_page(&format!("{CATEGORY}?page=2"), &listing(&["a-1", "b-2"], Some("?page=3")))
            .with_page(&format!("{CATEGORY}?page=3"), &listing(&["c-3"], None));

        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn test_first_page_failure_is_retried_then_reported() {
        let source = Arc::new(StaticPageSource::default());
        let mut d = CategoryDiscovery::new(
            source.clone(),
            Arc::new(ListingParser::new().unwrap()),
            CATEGORY,
            limits(10),
        );

        let err = d.next_page(&mut VisitedUrls::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PageLoad { stage: Stage::Discovery, .. }));
        // 404 is not retryable
        assert_eq!(source.load_count(CATEGORY), 1);
    }

    #[tokio::test]
    async fn test_later_page_failure_ends_category() {
        let source = StaticPageSource::default().with_page(CATEGORY, &listing(&["a-1", "b-2"], Some("?page=2")));

        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_first_page_yields_nothing() {
        let source = StaticPageSource::default().with_page(CATEGORY, "<html><body><p>No results</p></body></html>");
        let mut visited = VisitedUrls::new();
        let urls = discovery(source, 10).collect_all(&mut visited).await.unwrap();
        assert!(urls.is_empty());
    }
}
