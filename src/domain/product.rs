//! Product record - the single entity the harvester produces
//!
//! A record is created at extraction time, optionally enriched with an image
//! embedding, and persisted through an idempotent upsert keyed by
//! `(source, product_url)`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Path marker that carries the retailer's product code (`/p/<code>`).
const PRODUCT_CODE_MARKER: &str = "/p/";

/// Length of the hex digest used when a URL carries no product code.
const HASH_ID_LEN: usize = 16;

/// Stable product identifier derived from the product URL.
///
/// Format: `"{source}_{code}"` where `code` is the path segment after `/p/`,
/// or `"{source}_{hash16}"` (BLAKE3 of the canonical URL) when there is none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Derive the identifier for `url` under `source`.
    ///
    /// Query strings and fragments are ignored, so repeated scrapes of the same
    /// product always produce the same id.
    pub fn from_url(source: &str, url: &str) -> Self {
        let canonical = canonical_product_url(url);
        let code = product_code(&canonical).unwrap_or_else(|| {
            let digest = blake3::hash(canonical.as_bytes()).to_hex();
            digest[..HASH_ID_LEN].to_string()
        });
        Self(format!("{source}_{code}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProductId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Strip query string, fragment and trailing slash from a product URL.
///
/// Unparsable input is returned trimmed with anything after `?`/`#` removed.
pub fn canonical_product_url(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let mut out = parsed.to_string();
            if out.ends_with('/') && parsed.path() != "/" {
                out.pop();
            }
            out
        }
        Err(_) => url
            .trim()
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Lowercase words of the URL path, split on `/`, `-` and `_`. The host and
/// query are never inspected.
fn url_path_words(url: &str) -> Vec<String> {
    let path = match Url::parse(url.trim()) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.split(['/', '-', '_'])
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Extract the product code following `/p/` in a canonical URL.
fn product_code(canonical: &str) -> Option<String> {
    let start = canonical.find(PRODUCT_CODE_MARKER)? + PRODUCT_CODE_MARKER.len();
    let code = canonical[start..].split('/').next()?.trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// Target audience of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Man,
    Woman,
    Unisex,
    #[default]
    Other,
}

impl Gender {
    /// Infer the gender from an explicit hint, falling back to the URL path.
    pub fn infer(hint: Option<&str>, url: &str) -> Self {
        if let Some(gender) = hint.and_then(Self::parse_hint) {
            return gender;
        }

        url_path_words(url)
            .into_iter()
            .find_map(|word| match word.as_str() {
                "women" | "womens" | "woman" | "ladies" => Some(Self::Woman),
                "men" | "mens" | "man" => Some(Self::Man),
                "unisex" => Some(Self::Unisex),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn parse_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_lowercase().as_str() {
            "m" | "male" | "man" | "men" | "mens" => Some(Self::Man),
            "f" | "w" | "female" | "woman" | "women" | "womens" => Some(Self::Woman),
            "u" | "unisex" => Some(Self::Unisex),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Man => "MAN",
            Self::Woman => "WOMAN",
            Self::Unisex => "UNISEX",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured product attributes extracted from a product page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub source: String,
    pub product_url: String,
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub brand: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub gender: Gender,
    pub price: Option<f64>,
    pub currency: String,
    #[serde(default)]
    pub sizes: Vec<String>,
    pub second_hand: bool,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProductRecord {
    /// Attach an embedding vector.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Map the record to the shape stored in the remote `products` table.
    pub fn to_row(&self) -> ProductRow {
        ProductRow {
            id: self.id.as_str().to_string(),
            source: self.source.clone(),
            product_url: self.product_url.clone(),
            image_url: self.image_url.clone().unwrap_or_default(),
            brand: self.brand.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            gender: self.gender.as_str().to_string(),
            price: self.price,
            currency: self.currency.clone(),
            size: if self.sizes.is_empty() {
                None
            } else {
                Some(self.sizes.join(", "))
            },
            second_hand: self.second_hand,
            embedding: self.embedding.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// Persisted row of the `products` table.
///
/// Column names follow the hosted schema: sizes are stored as a single
/// comma-separated `size` column and the vector column is omitted when absent
/// so an upsert never clears an existing embedding with `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: String,
    pub source: String,
    pub product_url: String,
    pub image_url: String,
    pub brand: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub gender: String,
    pub price: Option<f64>,
    pub currency: String,
    pub size: Option<String>,
    pub second_hand: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProductRow {
    /// Rebuild a record from a stored row.
    pub fn into_record(self) -> ProductRecord {
        let gender = Gender::parse_hint(&self.gender).unwrap_or_default();
        let sizes = self
            .size
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        ProductRecord {
            id: ProductId::from(self.id),
            source: self.source,
            product_url: self.product_url,
            image_url: Some(self.image_url).filter(|u| !u.is_empty()),
            image_urls: Vec::new(),
            brand: self.brand,
            title: self.title,
            description: self.description,
            category: self.category,
            gender,
            price: self.price,
            currency: self.currency,
            sizes,
            second_hand: self.second_hand,
            embedding: self.embedding,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_id_uses_product_code() {
        let id = ProductId::from_url("scraper", "https://www.abercrombie.com/shop/eu/p/linen-shirt-58231?seq=02");
        assert_eq!(id.as_str(), "scraper_linen-shirt-58231");
    }

    #[test]
    fn test_id_falls_back_to_hash() {
        let id = ProductId::from_url("scraper", "https://shop.example.com/item/123");
        assert!(id.as_str().starts_with("scraper_"));
        assert_eq!(id.as_str().len(), "scraper_".len() + HASH_ID_LEN);
    }

    #[test]
    fn test_canonical_url_strips_query_and_fragment() {
        assert_eq!(
            canonical_product_url("https://example.com/shop/p/abc/?color=red#reviews"),
            "https://example.com/shop/p/abc"
        );
        assert_eq!(canonical_product_url("/shop/p/abc?x=1"), "/shop/p/abc");
    }

    #[rstest]
    #[case(Some("M"), "https://x.com/anything", Gender::Man)]
    #[case(Some("female"), "https://x.com/anything", Gender::Woman)]
    #[case(Some("unisex"), "https://x.com/shop/mens", Gender::Unisex)]
    #[case(None, "https://x.com/shop/eu/womens-tops", Gender::Woman)]
    #[case(None, "https://x.com/shop/eu/mens-bottoms", Gender::Man)]
    #[case(Some("bogus"), "https://x.com/shop/kids", Gender::Other)]
    #[case(None, "https://x.com/shop/menu/shirts", Gender::Other)]
    #[case(None, "https://x.com/shop/eu/mentions", Gender::Other)]
    #[case(None, "https://women.example.com/shop/mens", Gender::Man)]
    #[case(None, "https://x.com/shop/eu/men_shirts?ref=women", Gender::Man)]
    #[case(None, "/shop/eu/p/womens-linen-shirt", Gender::Woman)]
    fn test_gender_inference(#[case] hint: Option<&str>, #[case] url: &str, #[case] expected: Gender) {
        assert_eq!(Gender::infer(hint, url), expected);
    }

    #[test]
    fn test_row_omits_missing_embedding() {
        let record = sample_record();
        let json = serde_json::to_value(record.to_row()).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["size"], "S, M, L");
        assert_eq!(json["gender"], "MAN");

        let with_vector = sample_record().with_embedding(vec![0.5, 0.5]);
        let json = serde_json::to_value(with_vector.to_row()).unwrap();
        assert_eq!(json["embedding"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_row_round_trips_sizes_and_gender() {
        let record = sample_record();
        let restored = record.to_row().into_record();
        assert_eq!(restored.sizes, record.sizes);
        assert_eq!(restored.gender, Gender::Man);
        assert_eq!(restored.id, record.id);
    }

    fn sample_record() -> ProductRecord {
        let url = "https://example.com/shop/p/tee-1";
        ProductRecord {
            id: ProductId::from_url("scraper", url),
            source: "scraper".to_string(),
            product_url: url.to_string(),
            image_url: Some("https://img.example.com/tee-1.jpg".to_string()),
            image_urls: vec![],
            brand: "Example".to_string(),
            title: "Tee".to_string(),
            description: None,
            category: Some("tops".to_string()),
            gender: Gender::Man,
            price: Some(25.0),
            currency: "EUR".to_string(),
            sizes: vec!["S".into(), "M".into(), "L".into()],
            second_hand: false,
            embedding: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    proptest! {
        #[test]
        fn prop_id_ignores_query_and_fragment(
            code in "[a-z0-9][a-z0-9-]{0,20}",
            query in "[a-z]{1,8}=[a-z0-9]{1,8}",
            fragment in "[a-z]{0,8}",
        ) {
            let base = format!("https://shop.example.com/eu/p/{code}");
            let noisy = format!("{base}?{query}#{fragment}");
            prop_assert_eq!(
                ProductId::from_url("src", &base),
                ProductId::from_url("src", &noisy)
            );
        }

        #[test]
        fn prop_hash_id_is_stable(path in "[a-z]{1,10}/[a-z0-9]{1,10}") {
            let url = format!("https://shop.example.com/{path}");
            let first = ProductId::from_url("src", &url);
            let second = ProductId::from_url("src", &url);
            prop_assert_eq!(first, second);
        }
    }
}
