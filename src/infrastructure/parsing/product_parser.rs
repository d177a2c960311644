//! Product page parser
//!
//! Reads product attributes from a rendered product page. Title is required;
//! every other field is best effort and left empty when no strategy matches.
//! Strategies per field, in order: configured DOM selectors, meta tags,
//! JSON-LD `Product` data, then page-wide heuristics.

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;

use super::price::parse_price;
use super::structured_data::{self, JsonLdReader};
use super::{
    ContextualParser, ParsingError, ParsingResult, ProductContext, compile_selectors, element_text,
    extract_text_with_fallbacks, resolve_url,
};
use crate::infrastructure::config::SelectorConfig;

/// Descriptions shorter than this are treated as missing
const MIN_DESCRIPTION_LEN: usize = 10;

/// Size labels longer than this are prompts ("Select your size"), not sizes
const MAX_SIZE_LABEL_LEN: usize = 12;

/// Raw attributes read from a product page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedProduct {
    pub title: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub image_urls: Vec<String>,
    pub description: Option<String>,
    pub sizes: Vec<String>,
    pub category: Option<String>,
    pub gender_hint: Option<String>,
    /// Extra identifiers (sku, color, brand) found in structured data
    pub metadata: Map<String, Value>,
}

pub struct ProductPageParser {
    title_selectors: Vec<Selector>,
    price_selectors: Vec<Selector>,
    image_selectors: Vec<Selector>,
    description_selectors: Vec<Selector>,
    size_selectors: Vec<Selector>,
    category_selectors: Vec<Selector>,
    document_title: Vec<Selector>,
    og_title: Vec<Selector>,
    og_image: Vec<Selector>,
    meta_description: Vec<Selector>,
    any_image: Vec<Selector>,
    size_options: Vec<Selector>,
    breadcrumb_items: Vec<Selector>,
    json_ld: JsonLdReader,
}

fn fixed(group: &str, selectors: &[&str]) -> ParsingResult<Vec<Selector>> {
    let owned: Vec<String> = selectors.iter().map(|s| (*s).to_string()).collect();
    compile_selectors(group, &owned)
}

impl ProductPageParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_selectors(&SelectorConfig::default())
    }

    pub fn with_selectors(selectors: &SelectorConfig) -> ParsingResult<Self> {
        Ok(Self {
            title_selectors: compile_selectors("title", &selectors.title)?,
            price_selectors: compile_selectors("price", &selectors.price)?,
            image_selectors: compile_selectors("image", &selectors.image)?,
            description_selectors: compile_selectors("description", &selectors.description)?,
            size_selectors: compile_selectors("sizes", &selectors.sizes)?,
            category_selectors: compile_selectors("category", &selectors.category)?,
            document_title: fixed("document_title", &["head > title", "title"])?,
            og_title: fixed("og_title", &["meta[property=\"og:title\"]"])?,
            og_image: fixed("og_image", &["meta[property=\"og:image\"]"])?,
            meta_description: fixed(
                "meta_description",
                &["meta[property=\"og:description\"]", "meta[name=\"description\"]"],
            )?,
            any_image: fixed("img", &["img"])?,
            size_options: fixed("size_option", &["button", "li", "option", "label", "span"])?,
            breadcrumb_items: fixed("breadcrumb_item", &["li", "a"])?,
            json_ld: JsonLdReader::new()?,
        })
    }

    fn title(&self, root: ElementRef, product_ld: Option<&Value>) -> Option<String> {
        extract_text_with_fallbacks(root, &self.title_selectors)
            .or_else(|| {
                extract_text_with_fallbacks(root, &self.document_title)
                    .and_then(|t| t.split('|').next().map(|s| s.trim().to_string()))
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| extract_text_with_fallbacks(root, &self.og_title))
            .or_else(|| product_ld.and_then(|p| structured_data::string_field(p, "name")))
    }

    fn price(&self, root: ElementRef, product_ld: Option<&Value>) -> Option<(f64, Option<String>)> {
        for selector in &self.price_selectors {
            for element in root.select(selector) {
                let text = element
                    .value()
                    .attr("content")
                    .map(ToString::to_string)
                    .or_else(|| element_text(&element));
                if let Some(parsed) = text.as_deref().and_then(|t| parse_price(t, true)) {
                    return Some((parsed.amount, parsed.currency));
                }
            }
        }

        if let Some(found) = product_ld.and_then(structured_data::offer_price) {
            return Some(found);
        }

        // Last resort: first currency-marked amount anywhere on the page
        element_text(&root)
            .and_then(|text| parse_price(&text, false))
            .map(|parsed| (parsed.amount, parsed.currency))
    }

    fn images(&self, root: ElementRef, product_ld: Option<&Value>, base_url: &str) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();

        for selector in &self.image_selectors {
            candidates.extend(root.select(selector).filter_map(|img| image_source(&img)));
        }
        candidates.extend(
            self.og_image
                .iter()
                .flat_map(|s| root.select(s))
                .filter_map(|m| m.value().attr("content").map(ToString::to_string)),
        );
        if let Some(product) = product_ld {
            candidates.extend(structured_data::image_urls(product));
        }
        if candidates.is_empty() {
            candidates.extend(self.largest_image(root));
        }

        let mut images = Vec::new();
        for candidate in candidates {
            if !is_usable_image(&candidate) {
                continue;
            }
            if let Ok(url) = resolve_url(&candidate, base_url) {
                if !images.contains(&url) {
                    images.push(url);
                }
            }
        }
        images
    }

    /// The `<img>` with the largest declared area, skipping inline and vector images.
    fn largest_image(&self, root: ElementRef) -> Option<String> {
        let dimension = |img: &ElementRef, attr: &str| -> u64 {
            img.value()
                .attr(attr)
                .and_then(|v| v.trim_end_matches("px").parse().ok())
                .unwrap_or(0)
        };

        self.any_image
            .iter()
            .flat_map(|s| root.select(s))
            .filter_map(|img| {
                let src = image_source(&img)?;
                is_usable_image(&src).then(|| (dimension(&img, "width").saturating_mul(dimension(&img, "height")), src))
            })
            .max_by_key(|(area, _)| *area)
            .map(|(_, src)| src)
    }

    fn description(&self, root: ElementRef, product_ld: Option<&Value>) -> Option<String> {
        let long_enough = |s: &String| s.chars().count() > MIN_DESCRIPTION_LEN;

        self.description_selectors
            .iter()
            .flat_map(|selector| root.select(selector))
            .filter_map(|element| super::element_value(&element))
            .find(long_enough)
            .or_else(|| extract_text_with_fallbacks(root, &self.meta_description).filter(long_enough))
            .or_else(|| {
                product_ld
                    .and_then(|p| structured_data::string_field(p, "description"))
                    .filter(long_enough)
            })
    }

    fn sizes(&self, root: ElementRef) -> Vec<String> {
        for selector in &self.size_selectors {
            for container in root.select(selector) {
                let mut sizes: Vec<String> = Vec::new();
                for option in self.size_options.iter().flat_map(|s| container.select(s)) {
                    // Leaf labels only, so a <li><button>M</button></li> counts once
                    if option.children().filter_map(ElementRef::wrap).next().is_some() {
                        continue;
                    }
                    if let Some(label) = element_text(&option) {
                        if label.chars().count() <= MAX_SIZE_LABEL_LEN && !sizes.contains(&label) {
                            sizes.push(label);
                        }
                    }
                }
                if !sizes.is_empty() {
                    return sizes;
                }
            }
        }
        Vec::new()
    }

    fn category(&self, root: ElementRef, title: &str, product_ld: Option<&Value>) -> Option<String> {
        for selector in &self.category_selectors {
            if let Some(crumbs) = root.select(selector).next() {
                let items: Vec<String> = self
                    .breadcrumb_items
                    .iter()
                    .flat_map(|s| crumbs.select(s))
                    .filter_map(|item| element_text(&item))
                    .filter(|text| !text.eq_ignore_ascii_case("home") && text != title)
                    .collect();
                if let Some(last) = items.last() {
                    return Some(last.clone());
                }
            }
        }
        product_ld.and_then(|p| structured_data::string_field(p, "category"))
    }

    fn structured_metadata(product_ld: Option<&Value>) -> (Option<String>, Map<String, Value>) {
        let mut metadata = Map::new();
        let Some(product) = product_ld else {
            return (None, metadata);
        };

        for key in ["sku", "mpn", "color", "material", "productID"] {
            if let Some(value) = structured_data::string_field(product, key) {
                metadata.insert(key.to_string(), Value::String(value));
            }
        }
        if let Some(brand) = structured_data::string_field(product, "brand") {
            metadata.insert("brand".to_string(), Value::String(brand));
        }

        let gender = product
            .get("audience")
            .and_then(|a| structured_data::string_field(a, "suggestedGender"))
            .or_else(|| structured_data::string_field(product, "gender"));

        (gender, metadata)
    }
}

impl ContextualParser for ProductPageParser {
    type Output = ParsedProduct;
    type Context = ProductContext;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<Self::Output> {
        let root = html.root_element();
        let product_ld = self.json_ld.product(html);
        let product_ld = product_ld.as_ref();

        let title = self
            .title(root, product_ld)
            .ok_or_else(|| ParsingError::required_field_missing("title", Some(context.url.as_str())))?;

        let (price, price_currency) = match self.price(root, product_ld) {
            Some((amount, currency)) => (Some(amount), currency),
            None => {
                debug!("No price found on {}", context.url);
                (None, None)
            }
        };

        let image_urls = self.images(root, product_ld, &context.url);
        let (gender_hint, metadata) = Self::structured_metadata(product_ld);
        let category = self.category(root, &title, product_ld);

        Ok(ParsedProduct {
            price,
            currency: price_currency.or_else(|| context.default_currency.clone()),
            image_url: image_urls.first().cloned(),
            image_urls,
            description: self.description(root, product_ld),
            sizes: self.sizes(root),
            category,
            gender_hint,
            metadata,
            title,
        })
    }
}

/// Image URL from `src`, lazy-loading attributes or the first `srcset` entry.
fn image_source(img: &ElementRef) -> Option<String> {
    let value = img.value();
    ["src", "data-src", "data-original"]
        .iter()
        .filter_map(|attr| value.attr(attr))
        .map(str::trim)
        .find(|src| is_usable_image(src))
        .or_else(|| {
            value
                .attr("srcset")
                .and_then(|set| set.split(',').next())
                .and_then(|entry| entry.split_whitespace().next())
        })
        .map(ToString::to_string)
}

fn is_usable_image(src: &str) -> bool {
    let lower = src.to_lowercase();
    !src.is_empty() && !lower.starts_with("data:") && !lower.split('?').next().unwrap_or_default().ends_with(".svg")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_URL: &str = "https://shop.example.com/shop/eu/p/linen-shirt-58231";

    fn parse(html: &str) -> ParsingResult<ParsedProduct> {
        let parser = ProductPageParser::new().unwrap();
        parser.parse_with_context(
            &Html::parse_document(html),
            &ProductContext::new(PRODUCT_URL).with_default_currency("EUR"),
        )
    }

    #[test]
    fn test_full_product_page() {
        let product = parse(
            r#"<html><head><title>Linen Shirt | Example Shop</title></head><body>
                 <nav class="breadcrumb"><ol><li><a href="/">Home</a></li><li><a href="/mens">Mens</a></li>
                   <li><a href="/mens/shirts">Shirts</a></li></ol></nav>
                 <h1 data-testid="product-title">Linen Button-Up Shirt</h1>
                 <span data-testid="product-price">€ 59,95</span>
                 <div class="product-gallery">
                   <img src="/img/shirt-front.jpg"><img data-src="/img/shirt-back.jpg" src="data:image/gif;base64,AAA">
                 </div>
                 <div data-testid="product-description">Breathable linen shirt with a relaxed fit.</div>
                 <ul class="size-selector"><li><button>S</button></li><li><button>M</button></li>
                   <li><button>L</button></li><li><button>Select your size</button></li></ul>
               </body></html>"#,
        )
        .unwrap();

        assert_eq!(product.title, "Linen Button-Up Shirt");
        assert_eq!(product.price, Some(59.95));
        assert_eq!(product.currency.as_deref(), Some("EUR"));
        assert_eq!(
            product.image_urls,
            vec![
                "https://shop.example.com/img/shirt-front.jpg",
                "https://shop.example.com/img/shirt-back.jpg"
            ]
        );
        assert_eq!(product.image_url.as_deref(), Some("https://shop.example.com/img/shirt-front.jpg"));
        assert_eq!(product.description.as_deref(), Some("Breathable linen shirt with a relaxed fit."));
        assert_eq!(product.sizes, vec!["S", "M", "L"]);
        assert_eq!(product.category.as_deref(), Some("Shirts"));
    }

    #[test]
    fn test_missing_price_is_not_an_error() {
        let product = parse("<h1>Canvas Tote</h1><p>Sold out</p>").unwrap();
        assert_eq!(product.title, "Canvas Tote");
        assert_eq!(product.price, None);
        assert_eq!(product.currency.as_deref(), Some("EUR"));
        assert!(product.sizes.is_empty());
        assert_eq!(product.description, None);
    }

    #[test]
    fn test_title_falls_back_to_document_title() {
        let product = parse("<html><head><title> Wool Scarf | Example Shop </title></head><body></body></html>").unwrap();
        assert_eq!(product.title, "Wool Scarf");
    }

    #[test]
    fn test_missing_title_is_required_field_error() {
        let err = parse("<html><body><p>Nothing here</p></body></html>").unwrap_err();
        assert_eq!(err, ParsingError::required_field_missing("title", Some(PRODUCT_URL)));
    }

    #[test]
    fn test_json_ld_fills_gaps() {
        let product = parse(
            r#"<html><head><script type="application/ld+json">
                 {"@type":"Product","name":"Puffer Jacket","sku":"AF-123","color":"Black",
                  "description":"Water-resistant puffer with recycled fill.",
                  "audience":{"@type":"PeopleAudience","suggestedGender":"female"},
                  "image":"https://cdn.example.com/puffer.jpg",
                  "offers":{"price":149.0,"priceCurrency":"USD"}}
               </script></head><body></body></html>"#,
        )
        .unwrap();

        assert_eq!(product.title, "Puffer Jacket");
        assert_eq!(product.price, Some(149.0));
        assert_eq!(product.currency.as_deref(), Some("USD"));
        assert_eq!(product.image_url.as_deref(), Some("https://cdn.example.com/puffer.jpg"));
        assert_eq!(product.gender_hint.as_deref(), Some("female"));
        assert_eq!(product.metadata["sku"], "AF-123");
        assert_eq!(product.description.as_deref(), Some("Water-resistant puffer with recycled fill."));
    }

    #[test]
    fn test_largest_image_fallback_skips_svg() {
        let product = parse(
            r#"<h1>Sneaker</h1>
               <img src="/logo.svg" width="2000" height="2000">
               <img src="/thumb.jpg" width="100" height="100">
               <img src="/hero.jpg" width="800" height="1000">"#,
        )
        .unwrap();
        assert_eq!(product.image_url.as_deref(), Some("https://shop.example.com/hero.jpg"));
    }

    #[test]
    fn test_oversized_image_dimensions_do_not_overflow() {
        let product = parse(
            r#"<h1>Sneaker</h1>
               <img src="/hero.jpg" width="800" height="1000">
               <img src="/banner.jpg" width="18446744073709551615" height="4000000000">"#,
        )
        .unwrap();
        assert_eq!(product.image_url.as_deref(), Some("https://shop.example.com/banner.jpg"));
    }
}
