//! JSON span extraction: find the one JSON document inside a model answer.
//!
//! Models are told to return raw JSON, but real answers arrive wrapped in
//! ```` ```json ```` fences, preceded by "Here is the extracted data:", or
//! followed by a closing remark. Taking the first `{` to the last `}` breaks
//! as soon as a string value contains a brace (`"address": "Unit {4}"`) or
//! the prose after the JSON contains one, so the fallback path is a single
//! pass bracket-depth scan that ignores everything inside string literals.
//!
//! ## Strategy
//!
//! 1. First ```` ```json ```` fenced block, if its content parses → done.
//! 2. Otherwise scan for the first top-level `{` or `[` and follow it to the
//!    matching close at depth 0. Only the opening character's own pair is
//!    counted, so `{ "a": [ }` style imbalance in the other pair is ignored.
//! 3. The candidate is returned only if it parses as JSON.

use crate::error::SpanError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());

/// Return the JSON object or array embedded in `text`.
///
/// The returned slice borrows from `text` and is guaranteed to parse.
pub fn extract_json_span(text: &str) -> Result<&str, SpanError> {
    if let Some(inner) = fenced_block(text) {
        if is_json_document(inner) {
            debug!("JSON span: fenced block, {} bytes", inner.len());
            return Ok(inner);
        }
        debug!("Fenced json block does not parse; falling back to bracket scan");
    }

    if let Some(candidate) = scan_balanced(text) {
        if is_json_document(candidate) {
            debug!("JSON span: bracket scan, {} bytes", candidate.len());
            return Ok(candidate);
        }
    }

    Err(SpanError::NoJsonFound {
        text: text.to_string(),
    })
}

fn fenced_block(text: &str) -> Option<&str> {
    RE_JSON_FENCE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn is_json_document(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(candidate),
        Ok(Value::Object(_) | Value::Array(_))
    )
}

/// Single-pass scan for the first balanced `{…}` or `[…]` outside strings.
///
/// A backslash suppresses whatever single character follows it, including a
/// quote, so `"say \"hi\" {"` stays one string.
fn scan_balanced(text: &str) -> Option<&str> {
    let mut start: Option<usize> = None;
    let mut pair: Option<(char, char)> = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }

        match pair {
            None => {
                let close = match c {
                    '{' => '}',
                    '[' => ']',
                    _ => continue,
                };
                start = Some(i);
                pair = Some((c, close));
                depth = 1;
            }
            Some((open, close)) => {
                if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth == 0 {
                        let s = start?;
                        return Some(&text[s..i + c.len_utf8()]);
                    }
                }
            }
        }
    }

    None
}
