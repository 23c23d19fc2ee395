use regex::{Regex, RegexBuilder};
use studyweave_utils::error::ParseError;

/// Custom start/end markers around a payload, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub start: String,
    pub end: String,
}

impl Delimiters {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

fn literal(marker: &str) -> Result<Regex, ParseError> {
    RegexBuilder::new(&regex::escape(marker))
        .case_insensitive(true)
        .build()
        .map_err(|e| ParseError::Malformed {
            reason: format!("unusable delimiter '{marker}': {e}"),
        })
}

/// Text between the delimiters, `None` when the start marker is absent.
fn between<'a>(raw: &'a str, delimiters: &Delimiters) -> Result<Option<&'a str>, ParseError> {
    let Some(start) = literal(&delimiters.start)?.find(raw) else {
        return Ok(None);
    };
    let rest = &raw[start.end()..];
    match literal(&delimiters.end)?.find(rest) {
        Some(end) => Ok(Some(rest[..end.start()].trim())),
        None => Err(ParseError::Incomplete {
            reason: format!("end delimiter '{}' not found", delimiters.end),
        }),
    }
}

enum Scan {
    Balanced(usize),
    Unterminated,
    Mismatched,
}

/// Scan from an opening brace at `text[0]` to its matching close, skipping
/// brackets inside string literals.
fn scan_balanced(text: &str) -> Scan {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(ch) {
                    return Scan::Mismatched;
                }
                if closers.is_empty() {
                    return Scan::Balanced(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    Scan::Unterminated
}

/// True when `text` is valid JSON cut short, as opposed to not JSON at all.
fn is_json_prefix(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_err_and(|e| e.is_eof())
}

/// Locate the structured block inside a raw response.
///
/// With delimiters, the search is narrowed to the text between them. The
/// whole trimmed text is tried first and then every balanced `{...}` in order
/// of appearance.
pub(crate) fn locate<'a>(
    raw: &'a str,
    delimiters: Option<&Delimiters>,
) -> Result<&'a str, ParseError> {
    let scope = match delimiters {
        Some(delimiters) => between(raw, delimiters)?.unwrap_or(raw),
        None => raw,
    };

    let text = scope.trim();
    if text.is_empty() {
        return Err(ParseError::NoStructuredBlock);
    }
    if serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return Ok(text);
    }

    let mut malformed = None;
    for (offset, _) in text.match_indices('{') {
        let candidate = &text[offset..];
        match scan_balanced(candidate) {
            Scan::Balanced(len) => {
                let block = &candidate[..len];
                match serde_json::from_str::<serde_json::Value>(block) {
                    Ok(_) => return Ok(block),
                    Err(e) => {
                        tracing::debug!(offset, error = %e, "skipping malformed candidate block");
                        malformed.get_or_insert(ParseError::Malformed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            // A cut-off JSON prefix is a truncated payload; its nested objects
            // would balance on their own and must not be taken for the payload.
            // Anything else is a stray brace in prose.
            Scan::Unterminated if is_json_prefix(candidate) => {
                return Err(ParseError::Incomplete {
                    reason: format!("object opened at offset {offset} is never closed"),
                });
            }
            Scan::Unterminated => {
                tracing::debug!(offset, "skipping unclosed brace in prose");
            }
            Scan::Mismatched => {}
        }
    }

    Err(malformed.unwrap_or(ParseError::NoStructuredBlock))
}
