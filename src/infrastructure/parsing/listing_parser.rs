//! Category listing parser
//!
//! Extracts product links and the next-page URL from a listing page. The
//! next page is derived from page content only, so a walk can be restarted
//! from any listing URL.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::structured_data::JsonLdReader;
use super::{ContextualParser, ListingContext, ParsingError, ParsingResult, compile_selectors, resolve_url};
use crate::domain::product::canonical_product_url;
use crate::infrastructure::config::SelectorConfig;

/// Query parameter incremented when pagination is a button without an href
const PAGE_PARAM: &str = "page";

/// Links and pagination found on one listing page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    /// Canonical product URLs, in page order, without duplicates
    pub product_urls: Vec<String>,
    pub next_page_url: Option<String>,
}

pub struct ListingParser {
    link_selectors: Vec<Selector>,
    next_page_selectors: Vec<Selector>,
    load_more_selectors: Vec<Selector>,
    path_markers: Vec<String>,
    json_ld: JsonLdReader,
}

impl ListingParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_selectors(&SelectorConfig::default())
    }

    pub fn with_selectors(selectors: &SelectorConfig) -> ParsingResult<Self> {
        Ok(Self {
            link_selectors: compile_selectors("product_link", &selectors.product_link)?,
            next_page_selectors: compile_selectors("next_page", &selectors.next_page)?,
            load_more_selectors: compile_selectors("load_more", &selectors.load_more)?,
            path_markers: selectors.product_path_markers.clone(),
            json_ld: JsonLdReader::new()?,
        })
    }

    fn is_product_url(&self, url: &str) -> bool {
        self.path_markers.is_empty() || self.path_markers.iter().any(|marker| url.contains(marker.as_str()))
    }

    fn collect_product_urls(&self, html: &Html, context: &ListingContext) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |candidate: &str| {
            match resolve_url(candidate, &context.page_url) {
                Ok(resolved) if self.is_product_url(&resolved) => {
                    let canonical = canonical_product_url(&resolved);
                    if !urls.contains(&canonical) {
                        urls.push(canonical);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Ignoring link '{}': {}", candidate, e),
            }
        };

        for selector in &self.link_selectors {
            for element in html.select(selector) {
                if let Some(href) = link_href(&element) {
                    push(href);
                }
            }
        }

        for url in self.json_ld.item_list_urls(html) {
            push(&url);
        }

        urls
    }

    /// Next listing URL, or `None` when the control is missing or disabled.
    fn next_page_url(&self, html: &Html, context: &ListingContext) -> Option<String> {
        let control = self
            .next_page_selectors
            .iter()
            .find_map(|selector| html.select(selector).next());

        if let Some(element) = control {
            if is_disabled(&element) {
                debug!("Next-page control is disabled on page {}", context.page_number);
                return None;
            }
            if let Some(href) = element.value().attr("href") {
                match resolve_url(href, &context.page_url) {
                    Ok(url) => return Some(url),
                    Err(e) => debug!("Unusable next-page href '{}': {}", href, e),
                }
            }
            // A scripted button: fall back to the page query parameter
            return with_page_param(&context.page_url, context.page_number + 1);
        }

        let load_more = self
            .load_more_selectors
            .iter()
            .any(|selector| html.select(selector).any(|element| !is_disabled(&element)));
        if load_more {
            return with_page_param(&context.page_url, context.page_number + 1);
        }

        None
    }
}

impl ContextualParser for ListingParser {
    type Output = ListingPage;
    type Context = ListingContext;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<Self::Output> {
        debug!("Parsing listing page {} ({})", context.page_number, context.page_url);

        let product_urls = self.collect_product_urls(html, context);
        let next_page_url = self.next_page_url(html, context);

        if product_urls.is_empty() {
            warn!(
                "No product links found on listing page {} ({})",
                context.page_number, context.page_url
            );
            return Err(ParsingError::NoProductsFound {
                page_number: context.page_number,
                tried_selectors: self.path_markers.clone(),
            });
        }

        debug!(
            "Found {} product links on page {} (next: {:?})",
            product_urls.len(),
            context.page_number,
            next_page_url
        );

        Ok(ListingPage {
            product_urls,
            next_page_url,
        })
    }
}

fn link_href<'a>(element: &ElementRef<'a>) -> Option<&'a str> {
    if let Some(href) = element.value().attr("href") {
        return Some(href);
    }
    // Selector matched a card; use its first link
    element
        .descendants()
        .filter_map(ElementRef::wrap)
        .find_map(|child| child.value().attr("href"))
}

fn is_disabled(element: &ElementRef) -> bool {
    let value = element.value();
    value.attr("disabled").is_some()
        || value.attr("aria-disabled").is_some_and(|v| v.eq_ignore_ascii_case("true"))
        || value.classes().any(|c| c.eq_ignore_ascii_case("disabled"))
}

/// `page_url` with its `page` query parameter set to `page`.
fn with_page_param(page_url: &str, page: u32) -> Option<String> {
    let mut url = Url::parse(page_url).ok()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != PAGE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(PAGE_PARAM, &page.to_string());
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str, url: &str, page: u32) -> ParsingResult<ListingPage> {
        let parser = ListingParser::new().unwrap();
        parser.parse_with_context(&Html::parse_document(html), &ListingContext::new(url, page))
    }

    #[test]
    fn test_collects_unique_product_links() {
        let page = parse(
            r#"<main>
                 <a href="/shop/eu/p/linen-shirt-1?seq=01">Linen</a>
                 <a href="/shop/eu/p/linen-shirt-1?seq=02">Linen (alt colour)</a>
                 <a href="https://www.abercrombie.com/shop/eu/p/denim-2">Denim</a>
                 <a href="/shop/eu/help">Help</a>
               </main>"#,
            "https://www.abercrombie.com/shop/eu/mens",
            1,
        )
        .unwrap();

        assert_eq!(
            page.product_urls,
            vec![
                "https://www.abercrombie.com/shop/eu/p/linen-shirt-1",
                "https://www.abercrombie.com/shop/eu/p/denim-2",
            ]
        );
        assert_eq!(page.next_page_url, None);
    }

    #[test]
    fn test_next_link_resolves() {
        let page = parse(
            r#"<a href="/p/a">A</a><a rel="next" href="?page=2">Next</a>"#,
            "https://shop.example.com/mens",
            1,
        )
        .unwrap();
        assert_eq!(page.next_page_url.as_deref(), Some("https://shop.example.com/mens?page=2"));
    }

    #[test]
    fn test_disabled_next_stops() {
        let page = parse(
            r#"<a href="/p/a">A</a><button data-testid="pagination-next" aria-disabled="true">Next</button>"#,
            "https://shop.example.com/mens?page=4",
            4,
        )
        .unwrap();
        assert_eq!(page.next_page_url, None);
    }

    #[test]
    fn test_button_without_href_increments_page_param() {
        let page = parse(
            r#"<a href="/p/a">A</a><button class="load-more">Load more</button>"#,
            "https://shop.example.com/mens?sort=new&page=2",
            2,
        )
        .unwrap();
        assert_eq!(
            page.next_page_url.as_deref(),
            Some("https://shop.example.com/mens?sort=new&page=3")
        );
    }

    #[test]
    fn test_json_ld_item_list_links() {
        let page = parse(
            r#"<script type="application/ld+json">
               {"@type":"ItemList","itemListElement":[{"url":"https://shop.example.com/p/json-1"}]}
               </script>"#,
            "https://shop.example.com/mens",
            1,
        )
        .unwrap();
        assert_eq!(page.product_urls, vec!["https://shop.example.com/p/json-1"]);
    }

    #[test]
    fn test_empty_listing_is_an_error() {
        let err = parse("<p>No results</p>", "https://shop.example.com/mens", 1).unwrap_err();
        assert!(matches!(err, ParsingError::NoProductsFound { page_number: 1, .. }));
    }
}
