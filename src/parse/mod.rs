//! Structured-output extraction from model text.
//!
//! Models are prompted for JSON but wrap it in prose, code fences, or
//! preamble often enough that a single `serde_json::from_str` is not
//! reliable. Extraction runs an ordered list of pure strategies and
//! takes the first success:
//!
//! 1. parse the whole trimmed output directly
//! 2. parse the body of a fenced code block
//! 3. parse the first balanced `{...}` span
//!
//! Only when every strategy fails does the caller see a [`ParseError`].

use regex::Regex;
use serde_json::Value;

use crate::error::ParseError;

/// A pure extraction strategy. Returns `Some` only when it produced a
/// JSON object or array.
pub type ParseStrategy = fn(&str) -> Option<Value>;

/// Strategies in the order they are attempted.
pub const STRATEGIES: &[ParseStrategy] = &[parse_direct, parse_code_block, parse_first_object];

/// Extract the first JSON object or array found in `text`.
pub fn parse_structured(text: &str) -> Result<Value, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    for strategy in STRATEGIES {
        if let Some(value) = strategy(trimmed) {
            return Ok(value);
        }
    }

    let preview: String = trimmed.chars().take(80).collect();
    Err(ParseError::NoJsonFound { preview })
}

/// Strategy 1: the whole output is already valid JSON.
fn parse_direct(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(is_structured)
}

/// Strategy 2: JSON inside a fenced code block (```json ... ``` or
/// a bare ``` fence).
fn parse_code_block(text: &str) -> Option<Value> {
    let re = Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)```").ok()?;

    for captures in re.captures_iter(text) {
        let body = captures.get(1)?.as_str().trim();
        if let Some(value) = serde_json::from_str::<Value>(body)
            .ok()
            .filter(is_structured)
        {
            return Some(value);
        }
    }
    None
}

/// Strategy 3: the first balanced `{...}` span, scanning past string
/// literals and escapes so braces inside values don't end the span.
fn parse_first_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = find_matching_brace(&text[start..])?;
    serde_json::from_str::<Value>(&text[start..start + end + 1]).ok()
}

/// Find the index of the `}` matching the `{` at the start of `text`.
fn find_matching_brace(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_structured(value: &Value) -> bool {
    value.is_object() || value.is_array()
}
