//! Escape decoding for embedded documents.
//!
//! Embedded blobs arrive Unicode-escaped (`\uXXXX`), HTML-entity-escaped
//! (`&quot;`), or both. Unicode escapes are decoded first, then entities.

use std::borrow::Cow;

/// Decodes `\uXXXX` escape sequences, including UTF-16 surrogate pairs.
///
/// Other backslash sequences are left untouched, as are lone surrogates and
/// malformed escapes.
pub fn decode_unicode_escapes(text: &str) -> Cow<'_, str> {
    if !text.contains("\\u") {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("\\u") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        match parse_escape(tail) {
            Some(unit) if (0xD800..0xDC00).contains(&unit) => {
                let low = tail.get(6..).and_then(parse_escape);
                match low {
                    Some(low) if (0xDC00..0xE000).contains(&low) => {
                        let combined = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                        match char::from_u32(combined) {
                            Some(c) => out.push(c),
                            None => out.push_str(&tail[..12]),
                        }
                        rest = &tail[12..];
                    }
                    _ => {
                        out.push_str(&tail[..6]);
                        rest = &tail[6..];
                    }
                }
            }
            Some(unit) => {
                match char::from_u32(unit) {
                    Some(c) => out.push(c),
                    None => out.push_str(&tail[..6]),
                }
                rest = &tail[6..];
            }
            None => {
                out.push_str("\\u");
                rest = &tail[2..];
            }
        }
    }

    out.push_str(rest);
    Cow::Owned(out)
}

/// Parses a `\uXXXX` escape at the start of `text`.
fn parse_escape(text: &str) -> Option<u32> {
    let hex = text.strip_prefix("\\u")?.get(..4)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Decodes HTML entities in a single left-to-right pass.
///
/// Because each entity is decoded exactly once, `&amp;` is effectively
/// resolved last: `&amp;quot;` becomes `&quot;`, never `"`.
pub fn decode_html_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    html_escape::decode_html_entities(text)
}

/// Applies [`decode_unicode_escapes`] then [`decode_html_entities`].
pub fn decode_embedded(text: &str) -> String {
    let unicode = decode_unicode_escapes(text);
    decode_html_entities(&unicode).into_owned()
}
