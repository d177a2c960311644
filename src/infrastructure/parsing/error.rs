//! Parsing error types
//!
//! Detailed error types for HTML parsing with context for logs and recovery.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParsingError {
    #[error("Required field '{field}' not found in HTML")]
    RequiredFieldMissing { field: String, context: Option<String> },

    #[error("Invalid CSS selector: {selector} - {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("No valid selectors compiled for '{group}': {errors}")]
    NoValidSelectors { group: String, errors: String },

    #[error("No product links found on listing page {page_number}")]
    NoProductsFound { page_number: u32, tried_selectors: Vec<String> },

    #[error("URL resolution failed: {url} - {reason}")]
    UrlResolutionFailed {
        url: String,
        reason: String,
        base_url: Option<String>,
    },

    #[error("Structured data could not be read: {reason}")]
    StructuredData { reason: String },
}

impl ParsingError {
    pub fn required_field_missing(field: &str, context: Option<&str>) -> Self {
        Self::RequiredFieldMissing {
            field: field.to_string(),
            context: context.map(ToString::to_string),
        }
    }

    pub fn url_resolution_failed(url: &str, reason: impl Into<String>, base_url: Option<&str>) -> Self {
        Self::UrlResolutionFailed {
            url: url.to_string(),
            reason: reason.into(),
            base_url: base_url.map(ToString::to_string),
        }
    }

    /// Recoverable errors affect a single field or link; the rest of the page is still usable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidSelector { .. } | Self::UrlResolutionFailed { .. } | Self::StructuredData { .. } => true,
            Self::RequiredFieldMissing { .. } | Self::NoValidSelectors { .. } | Self::NoProductsFound { .. } => false,
        }
    }
}

pub type ParsingResult<T> = Result<T, ParsingError>;
