//! Parsing context for listing and product pages

/// Context for a category listing page
#[derive(Debug, Clone)]
pub struct ListingContext {
    /// URL the HTML was loaded from; relative links resolve against it
    pub page_url: String,

    /// 1-based listing page number
    pub page_number: u32,
}

impl ListingContext {
    pub fn new(page_url: impl Into<String>, page_number: u32) -> Self {
        Self {
            page_url: page_url.into(),
            page_number,
        }
    }
}

/// Context for a product detail page
#[derive(Debug, Clone)]
pub struct ProductContext {
    /// Product page URL; relative resources resolve against it
    pub url: String,

    /// Currency assumed when the page shows none
    pub default_currency: Option<String>,
}

impl ProductContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_currency: None,
        }
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = Some(currency.into());
        self
    }
}
