use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::{ExtractionResult, Strategy};
use crate::browser::BrowserSession;

/// Container keys tried in order, each directly holding an array of objects
/// that opens with a quoted field name.
const KEYS: &[&str] = &["data", "vessels", "ships", "tankers"];

static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    KEYS.iter()
        .map(|k| {
            let re = Regex::new(&format!(r#""{}"\s*:\s*\[\s*\{{\s*"[^"\\]+"\s*:"#, k)).unwrap();
            (*k, re)
        })
        .collect()
});

/// Recovers JSON objects embedded in raw page markup.
pub struct MarkupExtractor;

impl MarkupExtractor {
    pub fn extract_markup(&self, markup: &str) -> ExtractionResult {
        for (key, re) in PATTERNS.iter() {
            for hit in re.find_iter(markup) {
                let Some(start) = enclosing_open_brace(markup, hit.start()) else {
                    continue;
                };
                let Some(end) = matching_close_brace(markup, start) else {
                    continue;
                };
                let candidate = &markup[start..=end];
                let parsed: Value = match serde_json::from_str(candidate) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(key, offset = start, "Embedded JSON did not parse: {}", e);
                        continue;
                    }
                };
                if has_records(&parsed) {
                    return ExtractionResult::checked(
                        parsed,
                        format!("embedded JSON \"{}\" at offset {}", key, start),
                    );
                }
            }
        }
        ExtractionResult::NotFound
    }
}

impl Strategy for MarkupExtractor {
    fn name(&self) -> &'static str {
        "embedded-json"
    }

    fn attempt(&self, page: &dyn BrowserSession) -> Result<ExtractionResult> {
        let html = page.content()?;
        Ok(self.extract_markup(&html))
    }
}

fn has_records(v: &Value) -> bool {
    KEYS.iter()
        .any(|k| v.get(*k).and_then(Value::as_array).is_some_and(|a| !a.is_empty()))
}

/// Walks left from `from` to the `{` that encloses it, skipping balanced
/// `{...}` groups and double-quoted strings on the way.
fn enclosing_open_brace(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = from;
    while i > 0 {
        i -= 1;
        let b = bytes[i];
        if b == b'"' && !is_escaped(bytes, i) {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'}' => depth += 1,
            b'{' if depth == 0 => return Some(i),
            b'{' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Walks right from the `{` at `start` to its matching `}`, ignoring braces
/// inside string literals.
fn matching_close_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// An odd run of backslashes before `i` escapes the byte at `i`.
fn is_escaped(bytes: &[u8], i: usize) -> bool {
    bytes[..i].iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 1
}
