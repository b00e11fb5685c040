use crate::redact::redact;
use serde_json::{Map, Value};

/// Keys whose non-empty string values are always replaced outright.
pub const SENSITIVE_KEYS: &[&str] = &["session_api_key", "api_key", "llm_api_key"];
pub const REDACTED_VALUE: &str = "<redacted>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateOptions {
    pub max_len: usize,
    pub head: usize,
    pub tail: usize,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        TruncateOptions {
            max_len: 5000,
            head: 100,
            tail: 100,
        }
    }
}

impl TruncateOptions {
    /// Head/tail actually used. When they would cover the whole budget they
    /// are split evenly so the marker still stands for omitted text.
    fn effective_head_tail(&self) -> (usize, usize) {
        if self.head.saturating_add(self.tail) >= self.max_len {
            let head = self.max_len / 2;
            (head, self.max_len - head)
        } else {
            (self.head, self.tail)
        }
    }
}

pub fn truncation_marker(omitted: usize) -> String {
    format!("...<truncated {} chars>...", omitted)
}

/// Redact `s`, then bound its length to `max_len` characters plus the marker.
pub fn truncate_str(s: &str, opts: &TruncateOptions) -> String {
    let s = redact(s);
    let len = s.chars().count();
    if len <= opts.max_len {
        return s;
    }

    let (head, tail) = opts.effective_head_tail();
    let omitted = len - head - tail;
    let head_part: String = s.chars().take(head).collect();
    let tail_part: String = s.chars().skip(len - tail).collect();

    format!("{}{}{}", head_part, truncation_marker(omitted), tail_part)
}

/// Truncate every string in a JSON tree, returning a new tree.
pub fn truncate_value(value: &Value, opts: &TruncateOptions) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, opts)),
        Value::Array(items) => Value::Array(items.iter().map(|v| truncate_value(v, opts)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let sensitive = SENSITIVE_KEYS.contains(&key.as_str())
                    && v.as_str().is_some_and(|s| !s.is_empty());
                let v = if sensitive {
                    Value::String(REDACTED_VALUE.to_string())
                } else {
                    truncate_value(v, opts)
                };
                out.insert(key.clone(), v);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(max_len: usize, head: usize, tail: usize) -> TruncateOptions {
        TruncateOptions { max_len, head, tail }
    }

    #[test]
    fn test_short_strings_pass_through() {
        assert_eq!(truncate_str("hello", &opts(5, 1, 1)), "hello");
        assert_eq!(truncate_str("", &opts(0, 0, 0)), "");
    }

    #[test]
    fn test_head_and_tail_are_kept() {
        let s = format!("{}{}{}", "a".repeat(10), "x".repeat(80), "z".repeat(10));
        let out = truncate_str(&s, &opts(50, 10, 10));
        assert_eq!(out, format!("{}...<truncated 80 chars>...{}", "a".repeat(10), "z".repeat(10)));
    }

    #[test]
    fn test_rebalances_when_head_and_tail_cover_budget() {
        let s: String = ('a'..='z').collect();
        let out = truncate_str(&s, &opts(10, 8, 8));
        assert_eq!(out, "abcde...<truncated 16 chars>...vwxyz");
    }

    #[test]
    fn test_zero_tail_keeps_no_suffix() {
        let out = truncate_str("0123456789", &opts(5, 3, 0));
        assert_eq!(out, "012...<truncated 7 chars>...");
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let s = "é".repeat(30);
        let out = truncate_str(&s, &opts(10, 2, 2));
        assert_eq!(out, "éé...<truncated 26 chars>...éé");
    }

    #[test]
    fn test_length_bound_holds() {
        let cases = [(10, 2, 3), (10, 8, 8), (1, 0, 0), (7, 3, 3), (100, 10, 10)];
        for (max_len, head, tail) in cases {
            for len in [0usize, 1, 5, 9, 10, 11, 57, 300] {
                let s: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
                let o = opts(max_len, head, tail);
                let out = truncate_str(&s, &o);
                if len <= max_len {
                    assert_eq!(out, s);
                    continue;
                }
                let marker_len = truncation_marker(len).chars().count();
                let bound = max_len.max(head + tail + marker_len);
                assert!(out.chars().count() <= bound, "{:?} for len {}", o, len);

                let (h, t) = o.effective_head_tail();
                let head_part: String = s.chars().take(h).collect();
                let tail_part: String = s.chars().skip(len - t).collect();
                assert!(out.starts_with(&head_part));
                assert!(out.ends_with(&tail_part));
            }
        }
    }

    #[test]
    fn test_redacts_before_measuring() {
        let s = format!("ghp_{}", "A".repeat(40));
        assert_eq!(truncate_str(&s, &opts(30, 5, 5)), "<redacted-github-token>");
    }

    #[test]
    fn test_sensitive_keys_always_redacted() {
        let value = json!({"api_key": "abc123"});
        assert_eq!(truncate_value(&value, &TruncateOptions::default()), json!({"api_key": "<redacted>"}));

        let value = json!({
            "conversation": {"session_api_key": "s", "llm_api_key": "", "api_key": null},
            "events": [{"extras": {"api_key": 5}}]
        });
        let out = truncate_value(&value, &TruncateOptions::default());
        assert_eq!(out["conversation"]["session_api_key"], "<redacted>");
        assert_eq!(out["conversation"]["llm_api_key"], "");
        assert_eq!(out["conversation"]["api_key"], Value::Null);
        assert_eq!(out["events"][0]["extras"]["api_key"], 5);
    }

    #[test]
    fn test_tree_shape_is_preserved() {
        let long = "x".repeat(40);
        let value = json!({"a": [long, 1, true, null], "b": {"c": "short"}});
        let out = truncate_value(&value, &opts(20, 5, 5));
        assert_eq!(out["a"][0], "xxxxx...<truncated 30 chars>...xxxxx");
        assert_eq!(out["a"][1], 1);
        assert_eq!(out["a"][2], true);
        assert_eq!(out["a"][3], Value::Null);
        assert_eq!(out["b"]["c"], "short");
        // input untouched
        assert_eq!(value["a"][0].as_str().map(str::len), Some(40));
    }
}
