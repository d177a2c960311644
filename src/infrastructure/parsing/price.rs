//! Price text parsing
//!
//! Handles symbol-before (`€45.90`, `$1,299.00`), symbol-after (`45,90 €`) and
//! ISO-code (`EUR 45.90`) forms with either decimal separator.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SYMBOL_BEFORE: Regex = Regex::new(r"([€$£])\s*(\d[\d.,]*\d|\d)").expect("valid price regex");
    static ref SYMBOL_AFTER: Regex = Regex::new(r"(\d[\d.,]*\d|\d)\s*([€$£])").expect("valid price regex");
    static ref ISO_BEFORE: Regex = Regex::new(r"\b(EUR|USD|GBP)\s*(\d[\d.,]*\d|\d)").expect("valid price regex");
    static ref ISO_AFTER: Regex = Regex::new(r"(\d[\d.,]*\d|\d)\s*(EUR|USD|GBP)\b").expect("valid price regex");
    static ref BARE_NUMBER: Regex = Regex::new(r"\d[\d.,]*\d|\d").expect("valid price regex");
}

/// A price amount with the currency it was shown in, when recognisable.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrice {
    pub amount: f64,
    pub currency: Option<String>,
}

/// Parse the first price in `text`.
///
/// A bare number is accepted only when `allow_bare` is set, which callers use
/// for text taken from a dedicated price element.
pub fn parse_price(text: &str, allow_bare: bool) -> Option<ParsedPrice> {
    let with_currency = |amount: &str, code: &str| {
        normalize_amount(amount).map(|amount| ParsedPrice {
            amount,
            currency: Some(currency_code(code).to_string()),
        })
    };

    if let Some(c) = SYMBOL_BEFORE.captures(text) {
        return with_currency(&c[2], &c[1]);
    }
    if let Some(c) = SYMBOL_AFTER.captures(text) {
        return with_currency(&c[1], &c[2]);
    }
    if let Some(c) = ISO_BEFORE.captures(text) {
        return with_currency(&c[2], &c[1]);
    }
    if let Some(c) = ISO_AFTER.captures(text) {
        return with_currency(&c[1], &c[2]);
    }

    if allow_bare {
        let m = BARE_NUMBER.find(text)?;
        return normalize_amount(m.as_str()).map(|amount| ParsedPrice { amount, currency: None });
    }

    None
}

fn currency_code(symbol_or_code: &str) -> &str {
    match symbol_or_code {
        "€" => "EUR",
        "$" => "USD",
        "£" => "GBP",
        code => code,
    }
}

/// Turn `1.299,00`, `1,299.00` or `45,90` into a number.
///
/// The last separator is the decimal point unless it is followed by exactly
/// three digits, in which case it groups thousands.
fn normalize_amount(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = match compact.rfind(['.', ',']) {
        Some(pos) => {
            let (int_part, frac_part) = (&compact[..pos], &compact[pos + 1..]);
            let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
            let has_other_separator = int_part.contains(['.', ',']);
            if frac_part.len() == 3 && !has_other_separator {
                format!("{int_digits}{frac_part}")
            } else {
                format!("{int_digits}.{frac_part}")
            }
        }
        None => compact,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}
