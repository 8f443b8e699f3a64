//! Brace matching for JSON objects embedded in larger text.
//!
//! Regexes cannot find the end of an object that contains nested objects, so
//! extraction walks the text counting brace depth instead.

/// Returns the byte range of the object enclosing `pos`.
///
/// Tries every `{` before `pos`, nearest first, and keeps the first one whose
/// object is still open at `pos` with `pos` outside any string literal. The
/// returned range includes both braces.
pub fn enclosing_object(text: &str, pos: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let pos = pos.min(bytes.len());
    (0..pos)
        .rev()
        .filter(|&i| bytes[i] == b'{')
        .find_map(|start| object_spanning(bytes, start, pos).map(|end| (start, end)))
}

/// Finds the end (exclusive) of the object opening at `start`, provided it
/// spans `pos`.
///
/// Braces inside JSON string literals are ignored. A `{` that itself sits in
/// a string literal tokenizes with the quotes inverted, which leaves `pos`
/// inside a string and rejects the candidate.
fn object_spanning(bytes: &[u8], start: usize, pos: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if i == pos && (in_string || depth == 0) {
            return None;
        }
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (i > pos).then_some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Returns the byte offsets of every `"key"` occurrence used as an object key.
///
/// An occurrence counts as a key only when the closing quote is followed by
/// optional whitespace and a colon, so the same word appearing as a plain
/// string value is skipped.
pub fn key_positions(text: &str, key: &str) -> Vec<usize> {
    let needle = format!("\"{}\"", key);
    text.match_indices(&needle)
        .filter(|(pos, _)| {
            text[pos + needle.len()..]
                .trim_start()
                .starts_with(':')
        })
        .map(|(pos, _)| pos)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(text: &str, pos: usize) -> Option<&str> {
        enclosing_object(text, pos).map(|(s, e)| &text[s..e])
    }

    #[test]
    fn flat_object() {
        let text = r#"prefix {"quiz":[1,2]} suffix"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(slice(text, pos), Some(r#"{"quiz":[1,2]}"#));
    }

    #[test]
    fn nested_objects_do_not_end_early() {
        let text = r#"<x>{"meta":{"a":{"b":1}},"quiz":[{"q":"x"},{"q":"y"}],"tail":{}}</x>"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(
            slice(text, pos),
            Some(r#"{"meta":{"a":{"b":1}},"quiz":[{"q":"x"},{"q":"y"}],"tail":{}}"#)
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored_forward() {
        let text = r#"{"quiz":[{"q":"what is {x}?"}],"note":"}"}"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(slice(text, pos), Some(text));
    }

    #[test]
    fn braces_inside_strings_are_ignored_backward() {
        let text = r#"<script>window.data = {"title":"set }","flashcards":[{"f":"x","b":"y"}]};</script>"#;
        let pos = text.find("\"flashcards\"").unwrap();
        assert_eq!(
            slice(text, pos),
            Some(r#"{"title":"set }","flashcards":[{"f":"x","b":"y"}]}"#)
        );

        let text = r#"{"title":"a {b","quiz":[1]}"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(slice(text, pos), Some(text));
    }

    #[test]
    fn closed_sibling_is_not_the_enclosing_object() {
        let text = r#"{"meta":{"a":1},"quiz":[2]}"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(slice(text, pos), Some(text));
    }

    #[test]
    fn unbalanced_returns_none() {
        let text = r#"{"quiz":[1,2"#;
        let pos = text.find("\"quiz\"").unwrap();
        assert_eq!(slice(text, pos), None);

        let text = r#""quiz":[1]}"#;
        assert_eq!(slice(text, 0), None);
    }

    #[test]
    fn key_positions_skip_plain_values() {
        let text = r#"{"title":"quiz","label":"quiz" ,"quiz" : []}"#;
        let positions = key_positions(text, "quiz");
        assert_eq!(positions.len(), 1);
        assert!(text[positions[0]..].starts_with("\"quiz\" :"));
    }
}
