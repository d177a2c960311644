//! HTML parsing infrastructure
//!
//! Trait-based parsers for category listings and product pages. Every field is
//! located through an ordered list of fallback selectors; the first selector
//! that yields a value wins.

pub mod context;
pub mod error;
pub mod listing_parser;
pub mod price;
pub mod product_parser;
pub mod structured_data;

pub use context::{ListingContext, ProductContext};
pub use error::{ParsingError, ParsingResult};
pub use listing_parser::{ListingPage, ListingParser};
pub use price::{ParsedPrice, parse_price};
pub use product_parser::{ParsedProduct, ProductPageParser};

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// Parser over a parsed document with contextual information
pub trait ContextualParser {
    type Output;
    type Context;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<Self::Output>;
}

/// Compile selector strings, skipping (and logging) invalid ones.
///
/// Fails only when none of the selectors in `group` compile. An empty list
/// yields an empty vector.
pub fn compile_selectors(group: &str, selector_strings: &[String]) -> ParsingResult<Vec<Selector>> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for selector_str in selector_strings {
        match Selector::parse(selector_str) {
            Ok(selector) => selectors.push(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {}", selector_str, e);
                errors.push(format!("'{selector_str}': {e}"));
            }
        }
    }

    if selectors.is_empty() && !errors.is_empty() {
        return Err(ParsingError::NoValidSelectors {
            group: group.to_string(),
            errors: errors.join(", "),
        });
    }

    if !errors.is_empty() {
        debug!("Some '{}' selectors failed to compile: {}", group, errors.join(", "));
    }

    Ok(selectors)
}

/// Element text with whitespace collapsed; `None` when blank.
pub fn element_text(element: &ElementRef) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() { None } else { Some(normalized) }
}

/// Text content, or the `content` attribute for `<meta>` elements.
pub fn element_value(element: &ElementRef) -> Option<String> {
    if element.value().name() == "meta" {
        return element
            .value()
            .attr("content")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
    }
    element_text(element)
}

/// First non-empty value produced by any selector, in order.
pub fn extract_text_with_fallbacks(root: ElementRef, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .find_map(|selector| root.select(selector).find_map(|element| element_value(&element)))
}

/// Resolve `href` against `base_url`.
pub fn resolve_url(href: &str, base_url: &str) -> ParsingResult<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return Err(ParsingError::url_resolution_failed(href, "not a navigable link", Some(base_url)));
    }

    let base = Url::parse(base_url)
        .map_err(|e| ParsingError::url_resolution_failed(base_url, format!("Invalid base URL: {e}"), None))?;

    base.join(href)
        .map(|url| url.to_string())
        .map_err(|e| ParsingError::url_resolution_failed(href, format!("Failed to join URL: {e}"), Some(base_url)))
}
