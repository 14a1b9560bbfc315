//! Lenient JSON handling for embedded stream payloads
//!
//! Providers embed payloads that are not always strict JSON: single-quoted
//! strings, trailing commas, or values split across several stream records.
//! This module decides when an accumulated payload is complete and coerces it
//! into something `serde_json` accepts.

use serde_json::Value;

/// Detects if a JSON-ish string is complete (balanced braces, brackets and
/// quotes). Single- and double-quoted strings are both honoured.
pub fn is_json_complete(json_str: &str) -> bool {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return false;
    }

    let mut brace_count = 0i32;
    let mut bracket_count = 0i32;
    let mut quote: Option<char> = None;
    let mut escape_next = false;

    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match (quote, ch) {
            (Some(_), '\\') => escape_next = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, '{') => brace_count += 1,
            (None, '}') => brace_count -= 1,
            (None, '[') => bracket_count += 1,
            (None, ']') => bracket_count -= 1,
            _ => {}
        }

        // Early exit if we have unbalanced closing braces
        if brace_count < 0 || bracket_count < 0 {
            return false;
        }
    }

    quote.is_none() && brace_count == 0 && bracket_count == 0
}

/// Rewrites single-quoted strings as double-quoted ones and drops trailing
/// commas before a closing bracket or brace.
pub fn normalize_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            Some('\'') => match ch {
                '\\' => match chars.next() {
                    Some('\'') => out.push('\''),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                },
                '"' => out.push_str("\\\""),
                '\'' => {
                    out.push('"');
                    quote = None;
                }
                c => out.push(c),
            },
            Some(_) => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if ch == '"' {
                    quote = None;
                }
            }
            None => match ch {
                '\'' => {
                    out.push('"');
                    quote = Some('\'');
                }
                '"' => {
                    out.push('"');
                    quote = Some('"');
                }
                ',' => {
                    let mut lookahead = chars.clone();
                    let next_significant = lookahead.find(|c| !c.is_whitespace());
                    if !matches!(next_significant, Some(']') | Some('}')) {
                        out.push(',');
                    }
                }
                c => out.push(c),
            },
        }
    }

    out
}

/// Parses a complete payload value, strictly first and then after quote
/// normalization. Returns `None` when neither succeeds.
pub fn parse_payload_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let normalized = normalize_quotes(trimmed);
    match serde_json::from_str::<Value>(&normalized) {
        Ok(value) => {
            tracing::debug!(
                "[JSON-REPAIR] Normalized lenient payload: {} -> {} chars",
                trimmed.len(),
                normalized.len()
            );
            Some(value)
        }
        Err(e) => {
            tracing::trace!("[JSON-REPAIR] Payload still invalid after normalization: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_json_complete_valid() {
        assert!(is_json_complete("{}"));
        assert!(is_json_complete(r#"{"key": "value"}"#));
        assert!(is_json_complete("['http://a.com']"));
        assert!(is_json_complete(r#"[1, 2, 3]"#));
    }

    #[test]
    fn test_is_json_complete_incomplete() {
        assert!(!is_json_complete("{"));
        assert!(!is_json_complete(r#"{"key": "value""#));
        assert!(!is_json_complete("['http://a.com',"));
        assert!(!is_json_complete("['http://a.com"));
    }

    #[test]
    fn test_is_json_complete_ignores_brackets_inside_strings() {
        assert!(is_json_complete(r#"["a]b"]"#));
        assert!(is_json_complete("['a]b']"));
        assert!(is_json_complete(r#"{"key": "val\"ue"}"#));
        assert!(!is_json_complete(r#"{"key": "val\"ue"#));
    }

    #[test]
    fn test_normalize_single_quotes() {
        assert_eq!(
            normalize_quotes("['http://a.com', 'it\\'s']"),
            r#"["http://a.com", "it's"]"#
        );
        assert_eq!(normalize_quotes(r#"['say "hi"']"#), r#"["say \"hi\""]"#);
    }

    #[test]
    fn test_normalize_drops_trailing_commas() {
        assert_eq!(normalize_quotes("[1, 2, ]"), "[1, 2 ]");
        assert_eq!(normalize_quotes(r#"{"a": "x,}"}"#), r#"{"a": "x,}"}"#);
    }

    #[test]
    fn test_parse_payload_value_lenient() {
        let value = parse_payload_value("['http://a.com','http://b.com']");
        assert_eq!(
            value,
            Some(serde_json::json!(["http://a.com", "http://b.com"]))
        );
        assert_eq!(parse_payload_value("not json"), None);
    }
}
