//! Request/response capture helpers for the audit log
//!
//! Values of keys containing `secret`, `token`, or `password` are masked
//! before anything reaches the log; large responses collapse to a
//! truncated preview.

use serde_json::Value;

/// Response previews are capped at this many characters.
const RESPONSE_PREVIEW_LIMIT: usize = 800;
/// Error messages recorded in log metadata are capped here.
pub const ERROR_CAPTURE_LIMIT: usize = 500;

/// Masks sensitive values recursively.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_sensitive_key(&key) {
                    out.insert(key, Value::String("***".into()));
                } else {
                    out.insert(key, sanitize_value(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

pub fn sanitize_payload(payload: &Option<Value>) -> Option<Value> {
    payload.as_ref().map(|v| sanitize_value(v.clone()))
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["secret", "token", "password", "api_key"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Collapses structured responses into a bounded preview string.
pub fn summarize_value(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        _ => {
            let text = serde_json::to_string(value).unwrap_or_else(|_| "<invalid>".into());
            Value::String(truncate(&text, RESPONSE_PREVIEW_LIMIT))
        }
    }
}

/// Char-boundary-safe truncation with an ellipsis marker.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys_masked() {
        let sanitized = sanitize_value(json!({
            "name": "tenant",
            "app_secret": "hunter2",
            "nested": {"access_token": "abc", "keep": 1},
            "items": [{"password": "x"}],
        }));
        assert_eq!(sanitized["name"], "tenant");
        assert_eq!(sanitized["app_secret"], "***");
        assert_eq!(sanitized["nested"]["access_token"], "***");
        assert_eq!(sanitized["nested"]["keep"], 1);
        assert_eq!(sanitized["items"][0]["password"], "***");
    }

    #[test]
    fn test_scalars_pass_through_summary() {
        assert_eq!(summarize_value(&json!(42)), json!(42));
        assert_eq!(summarize_value(&json!("short")), json!("short"));
        assert_eq!(summarize_value(&Value::Null), Value::Null);
    }

    #[test]
    fn test_large_object_summarized() {
        let big = json!({"data": "x".repeat(2000)});
        let summary = summarize_value(&big);
        let text = summary.as_str().unwrap();
        assert!(text.chars().count() <= 801);
        assert!(text.ends_with('…'));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "日本語のテキスト";
        let cut = truncate(s, 3);
        assert_eq!(cut, "日本語…");
    }
}
