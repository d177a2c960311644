//! Visited-URL set threaded explicitly through discovery.

use std::collections::HashSet;

use super::product::canonical_product_url;

/// URLs already seen during a run, stored in canonical form.
#[derive(Debug, Clone, Default)]
pub struct VisitedUrls {
    seen: HashSet<String>,
}

impl VisitedUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `url`; returns `true` when it had not been seen before.
    pub fn insert(&mut self, url: &str) -> bool {
        self.seen.insert(canonical_product_url(url))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(&canonical_product_url(url))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Insert every URL and return only the newly seen ones, in input order.
    pub fn extend_new<I, S>(&mut self, urls: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter()
            .filter_map(|url| {
                let canonical = canonical_product_url(url.as_ref());
                self.seen.insert(canonical.clone()).then_some(canonical)
            })
            .collect()
    }
}
