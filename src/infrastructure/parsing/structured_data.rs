//! JSON-LD (`application/ld+json`) helpers
//!
//! Retail pages often embed schema.org `Product` and `ItemList` objects that
//! are more reliable than markup when class names change.

use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use super::{ParsingResult, compile_selectors};

pub struct JsonLdReader {
    script: Vec<Selector>,
}

impl JsonLdReader {
    pub fn new() -> ParsingResult<Self> {
        Ok(Self {
            script: compile_selectors("json_ld", &["script[type=\"application/ld+json\"]".to_string()])?,
        })
    }

    /// Every JSON-LD node on the page, with arrays and `@graph` flattened.
    pub fn nodes(&self, html: &Html) -> Vec<Value> {
        let mut nodes = Vec::new();
        for selector in &self.script {
            for script in html.select(selector) {
                let raw = script.text().collect::<String>();
                match serde_json::from_str::<Value>(raw.trim()) {
                    Ok(value) => flatten(value, &mut nodes),
                    Err(e) => debug!("Skipping unreadable JSON-LD block: {}", e),
                }
            }
        }
        nodes
    }

    /// The first `Product` node.
    pub fn product(&self, html: &Html) -> Option<Value> {
        self.nodes(html).into_iter().find(|node| has_type(node, "Product"))
    }

    /// Product URLs listed in `ItemList` nodes, in list order.
    pub fn item_list_urls(&self, html: &Html) -> Vec<String> {
        self.nodes(html)
            .iter()
            .filter(|node| has_type(node, "ItemList"))
            .filter_map(|node| node.get("itemListElement").and_then(Value::as_array))
            .flatten()
            .filter_map(|item| {
                item.get("url")
                    .or_else(|| item.get("item").and_then(|i| i.get("url").or(Some(i))))
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .collect()
    }
}

fn flatten(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|item| flatten(item, out)),
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten(graph, out);
            }
            if !map.is_empty() {
                out.push(Value::Object(map));
            }
        }
        _ => {}
    }
}

fn has_type(node: &Value, wanted: &str) -> bool {
    match node.get("@type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

/// String value at `key`, or the first string of an array.
pub fn string_field(node: &Value, key: &str) -> Option<String> {
    match node.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(|i| i.as_str()).map(ToString::to_string),
        Value::Object(obj) => obj.get("name").or_else(|| obj.get("url")).and_then(Value::as_str).map(ToString::to_string),
        _ => None,
    }
}

/// All image URLs of a `Product` node (`image` may be a string, list or `ImageObject`).
pub fn image_urls(node: &Value) -> Vec<String> {
    let as_url = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("url").and_then(Value::as_str).map(ToString::to_string),
        _ => None,
    };
    match node.get("image") {
        Some(Value::Array(items)) => items.iter().filter_map(as_url).collect(),
        Some(other) => as_url(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// `(price, currency)` from the first offer.
pub fn offer_price(node: &Value) -> Option<(f64, Option<String>)> {
    let offers = node.get("offers")?;
    let offer = match offers {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let price = match offer.get("price").or_else(|| offer.get("lowPrice"))? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.replace(',', ".").trim().parse().ok()?,
        _ => return None,
    };
    let currency = offer.get("priceCurrency").and_then(Value::as_str).map(ToString::to_string);
    Some((price, currency))
}
