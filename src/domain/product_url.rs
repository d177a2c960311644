use serde::{Deserialize, Serialize};
use std::fmt;

/// A product link found on a category listing, with its listing position.
///
/// Discovery hands these to extraction so the record can carry the category it
/// was found under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductUrl {
    /// Canonical product page URL
    pub url: String,
    /// Category root this product was discovered from
    pub category_url: String,
    /// Listing page number (1-based)
    pub page_number: u32,
    /// Position on the listing page (0-based)
    pub index_in_page: u32,
}

impl ProductUrl {
    pub fn new(url: String, category_url: String, page_number: u32, index_in_page: u32) -> Self {
        Self {
            url,
            category_url,
            page_number,
            index_in_page,
        }
    }

    /// A URL supplied directly (e.g. from the command line) with no listing context.
    pub fn standalone(url: impl Into<String>) -> Self {
        Self::new(url.into(), String::new(), 0, 0)
    }

    pub fn position(&self) -> (u32, u32) {
        (self.page_number, self.index_in_page)
    }
}

impl From<ProductUrl> for String {
    fn from(product_url: ProductUrl) -> Self {
        product_url.url
    }
}

impl AsRef<str> for ProductUrl {
    fn as_ref(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for ProductUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (page: {}, index: {})",
            self.url, self.page_number, self.index_in_page
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversions() {
        let url = ProductUrl::new(
            "https://shop.example.com/p/a".to_string(),
            "https://shop.example.com/mens".to_string(),
            2,
            5,
        );
        assert_eq!(url.to_string(), "https://shop.example.com/p/a (page: 2, index: 5)");
        assert_eq!(url.as_ref(), "https://shop.example.com/p/a");
        assert_eq!(url.position(), (2, 5));
        let raw: String = url.into();
        assert_eq!(raw, "https://shop.example.com/p/a");
    }
}
