//! Nested payload extraction.
//!
//! Some call results are not directly the JSON of interest. The service
//! renders an HTML document, stores it as a string inside the decoded JSON,
//! and hides the real payload in an escaped attribute of that document:
//!
//! ```text
//! [null, ["<div data-app-data=\"{&quot;quiz&quot;:[...]}\">", ...]]
//!                               └── HTML-escaped JSON blob ──┘
//! ```
//!
//! [`extract_payload`] first looks for the target as a plain object key
//! (the typed path). Only when that fails does it search for a string that
//! looks like an embedded document and run the fallback chain:
//!
//! 1. attribute-framed brace matching ([`Strategy::AttributeBraces`])
//! 2. whole-attribute regex extraction ([`Strategy::AttributeRegex`])
//! 3. direct marker-to-brace extraction ([`Strategy::DirectMarker`])
//!
//! Every traversal is bounded by [`MAX_SEARCH_DEPTH`].

mod brace;
pub mod content;
mod unescape;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{ExtractResult, ExtractionError, preview};

pub use brace::{enclosing_object, key_positions};
pub use unescape::{decode_embedded, decode_html_entities, decode_unicode_escapes};

/// Maximum nesting depth visited by any search.
pub const MAX_SEARCH_DEPTH: usize = 12;

/// Attribute the service stores embedded app data in.
pub const APP_DATA_ATTRIBUTE: &str = "data-app-data";

static APP_DATA_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"data-app-data\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("Invalid app-data regex")
});

/// Outcome of a bounded search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search<T> {
    /// The first match, in depth-first order.
    Found(T),
    /// Nothing matched within the depth bound.
    NotFound,
}

impl<T> Search<T> {
    /// Converts into an `Option`.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }

    /// Returns true if the search matched.
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// How a payload was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The target was a plain key in the decoded structure.
    Structured,
    /// Brace matching inside the `data-app-data` attribute.
    AttributeBraces,
    /// Whole-attribute regex capture, parsed as one document.
    AttributeRegex,
    /// Marker-to-brace matching with no attribute framing.
    DirectMarker,
}

/// A recovered payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPayload {
    /// The value stored under the target key.
    pub value: Value,
    /// The strategy that recovered it.
    pub strategy: Strategy,
}

/// Recovers the value stored under `target` somewhere inside `value`.
///
/// # Errors
///
/// Returns [`ExtractionError::NotFound`] when nothing within the depth bound
/// mentions the target, and [`ExtractionError::Exhausted`] when a candidate
/// was found but no strategy could recover a parseable payload from it.
pub fn extract_payload(value: &Value, target: &str) -> ExtractResult<ExtractedPayload> {
    if let Search::Found(found) = find_key(value, target) {
        return Ok(ExtractedPayload {
            value: found.clone(),
            strategy: Strategy::Structured,
        });
    }

    match find_embedded(value, target) {
        Search::Found(text) => extract_from_text(text, target),
        Search::NotFound => Err(ExtractionError::NotFound {
            target: target.to_string(),
            depth: MAX_SEARCH_DEPTH,
            preview: preview(&value.to_string()),
        }),
    }
}

/// Runs the fallback chain over one candidate string.
pub fn extract_from_text(text: &str, target: &str) -> ExtractResult<ExtractedPayload> {
    let unicode = decode_unicode_escapes(text);

    let chain = [
        Strategy::AttributeBraces,
        Strategy::AttributeRegex,
        Strategy::DirectMarker,
    ];

    for strategy in chain {
        let recovered = match strategy {
            Strategy::AttributeBraces => attribute_braces(&unicode, target),
            Strategy::AttributeRegex => attribute_regex(&unicode, target),
            Strategy::DirectMarker => direct_marker(text, &unicode, target),
            Strategy::Structured => None,
        };
        if let Some(value) = recovered {
            debug!(?strategy, target, "recovered embedded payload");
            return Ok(ExtractedPayload { value, strategy });
        }
        debug!(?strategy, target, "extraction strategy failed, falling back");
    }

    Err(ExtractionError::Exhausted {
        target: target.to_string(),
        preview: preview(text),
    })
}

/// Depth-bounded search for an object that has `key`.
pub fn find_key<'a>(value: &'a Value, key: &str) -> Search<&'a Value> {
    find_key_at(value, key, 0)
}

fn find_key_at<'a>(value: &'a Value, key: &str, depth: usize) -> Search<&'a Value> {
    if depth > MAX_SEARCH_DEPTH {
        return Search::NotFound;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Search::Found(found);
            }
            map.values()
                .map(|child| find_key_at(child, key, depth + 1))
                .find(Search::is_found)
                .unwrap_or(Search::NotFound)
        }
        Value::Array(items) => items
            .iter()
            .map(|child| find_key_at(child, key, depth + 1))
            .find(Search::is_found)
            .unwrap_or(Search::NotFound),
        _ => Search::NotFound,
    }
}

/// Depth-bounded search for a string that looks like it embeds `key`.
pub fn find_embedded<'a>(value: &'a Value, key: &str) -> Search<&'a str> {
    let markers = embedded_markers(key);
    find_embedded_at(value, &markers, 0)
}

fn find_embedded_at<'a>(value: &'a Value, markers: &[String], depth: usize) -> Search<&'a str> {
    if depth > MAX_SEARCH_DEPTH {
        return Search::NotFound;
    }
    match value {
        Value::String(text) if markers.iter().any(|m| text.contains(m.as_str())) => {
            Search::Found(text.as_str())
        }
        Value::Array(items) => items
            .iter()
            .map(|child| find_embedded_at(child, markers, depth + 1))
            .find(Search::is_found)
            .unwrap_or(Search::NotFound),
        Value::Object(map) => map
            .values()
            .map(|child| find_embedded_at(child, markers, depth + 1))
            .find(Search::is_found)
            .unwrap_or(Search::NotFound),
        _ => Search::NotFound,
    }
}

/// Text fragments that indicate a string may hide `key`.
fn embedded_markers(key: &str) -> Vec<String> {
    let unicode_quote = concat!("\\", "u0022");
    vec![
        APP_DATA_ATTRIBUTE.to_string(),
        format!("&quot;{}&quot;", key),
        format!("{}{}{}", unicode_quote, key, unicode_quote),
        format!("\"{}\"", key),
    ]
}

/// Returns the raw value of the first `data-app-data` attribute.
fn attribute_value(text: &str) -> Option<&str> {
    let start = text.find(APP_DATA_ATTRIBUTE)? + APP_DATA_ATTRIBUTE.len();
    let rest = text[start..].strip_prefix('=')?;
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(&body[..end])
}

fn attribute_braces(text: &str, key: &str) -> Option<Value> {
    let raw = attribute_value(text)?;
    let decoded = decode_html_entities(raw);
    object_with_key(&decoded, key)
}

fn attribute_regex(text: &str, key: &str) -> Option<Value> {
    APP_DATA_REGEX.captures_iter(text).find_map(|caps| {
        let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
        let decoded = decode_html_entities(raw);
        let document: Value = serde_json::from_str(&decoded).ok()?;
        find_key(&document, key).found().cloned()
    })
}

fn direct_marker(raw: &str, unicode: &str, key: &str) -> Option<Value> {
    let decoded = decode_html_entities(unicode);
    object_with_key(&decoded, key).or_else(|| object_with_key(raw, key))
}

/// Finds the first object in `text` that parses and has `key`.
///
/// Every key occurrence is tried in order, so a marker that appears earlier
/// in a sibling object does not stop the scan.
fn object_with_key(text: &str, key: &str) -> Option<Value> {
    key_positions(text, key).into_iter().find_map(|pos| {
        let (start, end) = enclosing_object(text, pos)?;
        match serde_json::from_str::<Value>(&text[start..end]) {
            Ok(Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    })
}
