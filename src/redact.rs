use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub const GITHUB_TOKEN_PLACEHOLDER: &str = "<redacted-github-token>";

/// Ordered (pattern, replacement) rules. Every replacement is itself a fixed
/// point of the table, so redacting twice changes nothing.
static REDACTION_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bghu_[A-Za-z0-9_]{20,}\b", GITHUB_TOKEN_PLACEHOLDER),
        (r"\bghp_[A-Za-z0-9_]{20,}\b", GITHUB_TOKEN_PLACEHOLDER),
        (r"\bgithub_pat_[A-Za-z0-9_]{20,}\b", GITHUB_TOKEN_PLACEHOLDER),
        (r"(https?://)([^/@\s]+)@github\.com", "${1}<redacted>@github.com"),
        (r#"(?i)(Authorization:\s*Bearer\s+)([^\s"]+)"#, "${1}<redacted>"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("redaction pattern must compile"),
            replacement,
        )
    })
    .collect()
});

/// Replace known secret shapes in `text` with placeholders.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, replacement) in REDACTION_RULES.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Redact every string leaf of a JSON tree. Keys are left alone.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Pretty JSON with sorted keys, redacted after serialization.
pub fn safe_json(value: &Value) -> String {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    redact(&json)
}
