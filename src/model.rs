use anyhow::{bail, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record from a conversation's event stream.
///
/// The typed fields are read out of the raw mapping with explicit presence and
/// type checks; a field with an unexpected type is treated as absent. The raw
/// mapping is kept as-is so an exported event serializes back without loss.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Event {
    pub id: Option<i64>,
    pub source: Option<String>,
    pub timestamp: Option<String>,
    pub action: Option<String>,
    pub args: Option<Map<String, Value>>,
    pub observation: Option<String>,
    pub cause: Option<i64>,
    pub content: Option<String>,
    pub message: Option<String>,
    pub extras: Option<Value>,
    pub tool_call_metadata: Option<Value>,
    raw: Map<String, Value>,
}

impl From<Map<String, Value>> for Event {
    fn from(raw: Map<String, Value>) -> Self {
        Event {
            id: int_field(&raw, "id"),
            source: str_field(&raw, "source"),
            timestamp: str_field(&raw, "timestamp"),
            action: str_field(&raw, "action"),
            args: raw.get("args").and_then(Value::as_object).cloned(),
            observation: str_field(&raw, "observation"),
            cause: int_field(&raw, "cause"),
            content: str_field(&raw, "content"),
            message: str_field(&raw, "message"),
            extras: non_null_field(&raw, "extras"),
            tool_call_metadata: non_null_field(&raw, "tool_call_metadata"),
            raw,
        }
    }
}

impl From<Event> for Map<String, Value> {
    fn from(event: Event) -> Self {
        event.raw
    }
}

impl Event {
    /// Raw field lookup, including fields without a typed accessor.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Transcript text: `args.content`, then `content`, then `message`.
    /// Blank candidates are skipped; returns "" when nothing matches.
    pub fn text(&self) -> &str {
        let from_args = self
            .args
            .as_ref()
            .and_then(|args| args.get("content"))
            .and_then(Value::as_str);

        [from_args, self.content.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .unwrap_or("")
    }

    /// Model name recorded on the event, if any.
    pub fn model_name(&self) -> Option<&str> {
        let from_metadata = self
            .tool_call_metadata
            .as_ref()
            .and_then(|m| m.get("model_response"))
            .and_then(|r| r.get("model"))
            .and_then(Value::as_str);
        if from_metadata.is_some() {
            return from_metadata;
        }

        for key in ["model", "llm_model", "provider_model", "selected_model"] {
            if let Some(model) = self.raw.get(key).and_then(Value::as_str) {
                return Some(model);
            }
        }

        let meta = self
            .raw
            .get("metadata")
            .filter(|m| !m.is_null())
            .or_else(|| self.raw.get("meta"));
        if let Some(meta) = meta {
            for key in ["model", "llm_model", "provider_model"] {
                if let Some(model) = meta.get(key).and_then(Value::as_str) {
                    return Some(model);
                }
            }
        }

        let args = self.args.as_ref()?;
        ["model", "llm_model"]
            .into_iter()
            .find_map(|key| args.get(key).and_then(Value::as_str))
    }
}

/// First model name found across a window of events.
pub fn model_from_events(events: &[Event]) -> Option<String> {
    events
        .iter()
        .find_map(|e| e.model_name())
        .map(str::to_string)
}

/// Conversation details as returned by the management API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ConversationDetails {
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub status: Option<String>,
    pub runtime_status: Option<String>,
    pub selected_repository: Option<String>,
    pub selected_branch: Option<String>,
    pub created_at: Option<String>,
    pub last_updated_at: Option<String>,
    pub url: Option<String>,
    pub session_api_key: Option<String>,
    raw: Map<String, Value>,
}

impl From<Map<String, Value>> for ConversationDetails {
    fn from(raw: Map<String, Value>) -> Self {
        ConversationDetails {
            conversation_id: str_field(&raw, "conversation_id"),
            title: str_field(&raw, "title"),
            status: str_field(&raw, "status"),
            runtime_status: str_field(&raw, "runtime_status"),
            selected_repository: str_field(&raw, "selected_repository"),
            selected_branch: str_field(&raw, "selected_branch"),
            created_at: str_field(&raw, "created_at"),
            last_updated_at: str_field(&raw, "last_updated_at"),
            url: str_field(&raw, "url"),
            session_api_key: str_field(&raw, "session_api_key"),
            raw,
        }
    }
}

impl From<ConversationDetails> for Map<String, Value> {
    fn from(details: ConversationDetails) -> Self {
        details.raw
    }
}

/// `{exported_at, base_url, conversation, events}` as written by `export`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub conversation: ConversationDetails,
    pub events: Vec<Event>,
}

impl ExportDocument {
    pub fn new(base_url: &str, conversation: ConversationDetails, events: Vec<Event>) -> Self {
        ExportDocument {
            exported_at: Some(chrono::Utc::now().to_rfc3339()),
            base_url: Some(base_url.to_string()),
            conversation,
            events,
        }
    }

    /// Read an export back. `conversation` must be a mapping and `events` a
    /// sequence; non-mapping entries in `events` are skipped.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut doc = match value {
            Value::Object(doc) => doc,
            other => bail!(
                "Input JSON does not look like a conversation export (top level is {})",
                json_kind(&other)
            ),
        };

        let conversation = match doc.remove("conversation") {
            Some(Value::Object(map)) => ConversationDetails::from(map),
            Some(other) => bail!(
                "Input JSON does not look like a conversation export (`conversation` is {})",
                json_kind(&other)
            ),
            None => bail!("Input JSON does not look like a conversation export (missing `conversation`)"),
        };

        let raw_events = match doc.remove("events") {
            Some(Value::Array(items)) => items,
            Some(other) => bail!(
                "Input JSON does not look like a conversation export (`events` is {})",
                json_kind(&other)
            ),
            None => bail!("Input JSON does not look like a conversation export (missing `events`)"),
        };

        Ok(ExportDocument {
            exported_at: str_field(&doc, "exported_at"),
            base_url: str_field(&doc, "base_url"),
            conversation,
            events: events_from_values(raw_events, "export"),
        })
    }
}

/// Compact summary of a conversation's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub runtime_status: Option<String>,
    pub created_at: Option<String>,
    pub last_updated_at: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub event_count: i64,
    pub model: Option<String>,
    pub first_message: Option<String>,
    pub url: Option<String>,
    pub has_runtime: bool,
}

/// Convert raw JSON entries into events, skipping anything that isn't a mapping.
pub fn events_from_values(items: Vec<Value>, origin: &str) -> Vec<Event> {
    let mut events = Vec::with_capacity(items.len());
    for (position, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => events.push(Event::from(map)),
            other => warn!(
                "Skipping {} entry at position {} in {} (not a mapping)",
                json_kind(&other),
                position,
                origin
            ),
        }
    }
    events
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_field(map: &Map<String, Value>, key: &str) -> Option<i64> {
    map.get(key).and_then(Value::as_i64)
}

fn non_null_field(map: &Map<String, Value>, key: &str) -> Option<Value> {
    map.get(key).filter(|v| !v.is_null()).cloned()
}
