use crate::classify::{classify, EventKind, ToolCallIndex};
use crate::model::{ConversationDetails, Event, ExportDocument};
use crate::redact::{redact, safe_json};
use crate::truncate::{truncate_str, TruncateOptions};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use log::debug;
use serde_json::{Map, Value};
use std::fmt::Write;

const COMMAND_PREVIEW_CHARS: usize = 120;
/// Tool output is left whole unless it exceeds head + tail by more than this.
const TRUNCATION_SLACK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub head: usize,
    pub tail: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            head: 100,
            tail: 100,
        }
    }
}

impl RenderOptions {
    fn truncation(&self) -> TruncateOptions {
        TruncateOptions {
            max_len: self.head + self.tail + TRUNCATION_SLACK,
            head: self.head,
            tail: self.tail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Before the first chat message.
    Preamble,
    Body,
}

/// Render an export as a markdown transcript.
pub fn render_markdown(doc: &ExportDocument, opts: &RenderOptions) -> String {
    let mut out = String::new();
    render_header(&mut out, &doc.conversation);
    out.push_str("## Transcript\n\n");

    let transcript = render_transcript(&doc.events, opts);
    if transcript.is_empty() {
        out.push_str("_No transcript events._\n");
    } else {
        out.push_str(&transcript);
    }

    let mut out = out.trim_end().to_string();
    out.push('\n');
    out
}

fn render_header(out: &mut String, convo: &ConversationDetails) {
    let title = convo
        .title
        .as_deref()
        .filter(|t| !t.is_empty())
        .or(convo.conversation_id.as_deref().filter(|id| !id.is_empty()))
        .unwrap_or("Conversation");
    let _ = writeln!(out, "# {}\n", redact(title));
    out.push_str("## Metadata\n\n");

    let fields = [
        ("Conversation ID", &convo.conversation_id),
        ("Repository", &convo.selected_repository),
        ("Branch", &convo.selected_branch),
        ("Created", &convo.created_at),
        ("Last updated", &convo.last_updated_at),
        ("Status", &convo.status),
    ];
    for (label, value) in fields {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            let _ = writeln!(out, "- {}: {}", label, inline_code(&redact(value)));
        }
    }
    out.push('\n');
}

/// Chat messages in order, with the tool activity between two messages
/// collected into one collapsible block.
fn render_transcript(events: &[Event], opts: &RenderOptions) -> String {
    let index = ToolCallIndex::build(events);
    debug!(
        "Rendering {} events ({} tool calls indexed)",
        events.len(),
        index.len()
    );

    let mut out = String::new();
    let mut pending: Vec<(&Event, EventKind)> = Vec::new();
    let mut region = Region::Preamble;

    for event in events {
        match classify(event) {
            EventKind::Noise => {}
            EventKind::Chat => {
                flush_tool_block(&mut out, &mut pending, region, &index, opts);
                region = Region::Body;
                render_chat_message(&mut out, event);
            }
            kind => pending.push((event, kind)),
        }
    }

    // Flush any remaining tool activity
    flush_tool_block(&mut out, &mut pending, region, &index, opts);

    out
}

fn flush_tool_block(
    out: &mut String,
    pending: &mut Vec<(&Event, EventKind)>,
    region: Region,
    index: &ToolCallIndex<'_>,
    opts: &RenderOptions,
) {
    if pending.is_empty() {
        return;
    }

    let label = match region {
        Region::Preamble => "Setup activity",
        Region::Body => "Tool activity",
    };
    let count = pending.len();
    let mut names: Vec<&str> = Vec::new();
    for (event, kind) in pending.iter() {
        let name = activity_name(event, *kind);
        if !names.contains(&name) {
            names.push(name);
        }
    }

    out.push_str("<details>\n");
    let _ = writeln!(
        out,
        "<summary>{} · {} {} · {}</summary>\n",
        label,
        count,
        if count == 1 { "event" } else { "events" },
        html_escape(&names.join(", "))
    );

    for (event, kind) in pending.drain(..) {
        debug_assert!(kind.is_tool_activity());
        match kind {
            EventKind::Invocation => render_invocation(out, event),
            EventKind::Observation => render_observation(out, event, index, opts),
            _ => render_note(out, event, opts),
        }
    }

    out.push_str("</details>\n\n");
}

fn activity_name(event: &Event, kind: EventKind) -> &str {
    let name = match kind {
        EventKind::Invocation => event.action.as_deref(),
        EventKind::Observation => event.observation.as_deref(),
        _ => None,
    };
    name.filter(|n| !n.is_empty()).unwrap_or("event")
}

fn render_chat_message(out: &mut String, event: &Event) {
    let role = match event.source.as_deref() {
        Some("user") => "User",
        Some("agent") => "Assistant",
        Some(other) => other,
        None => "Event",
    };
    let _ = writeln!(out, "### {}{}\n", role, event_suffix(event));
    let _ = writeln!(out, "{}\n", redact(event.text().trim()));
}

fn render_invocation(out: &mut String, event: &Event) {
    let action = event.action.as_deref().unwrap_or("tool call");
    let mut header = format!("**Tool call: {}**", action);

    let command = event
        .args
        .as_ref()
        .and_then(|args| args.get("command"))
        .and_then(Value::as_str);
    if let Some(command) = command {
        let preview: String = command
            .replace('\n', " ")
            .chars()
            .take(COMMAND_PREVIEW_CHARS)
            .collect();
        if !preview.trim().is_empty() {
            header.push_str(" · ");
            header.push_str(&inline_code(&redact(&preview)));
        }
    }
    let _ = writeln!(out, "{}{}\n", header, event_suffix(event));

    let mut call = Map::new();
    for key in ["action", "args", "timeout"] {
        if let Some(value) = event.get(key) {
            call.insert(key.to_string(), value.clone());
        }
    }
    push_fenced(out, "json", &safe_json(&Value::Object(call)));
}

fn render_observation(
    out: &mut String,
    event: &Event,
    index: &ToolCallIndex<'_>,
    opts: &RenderOptions,
) {
    let parts: Vec<&str> = [event.observation.as_deref(), index.cause_action(event)]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();
    let summary = if parts.is_empty() {
        "tool result".to_string()
    } else {
        parts.join(" / ")
    };
    let _ = writeln!(out, "**Tool result: {}**{}\n", summary, event_suffix(event));
    render_text_and_extras(out, event, opts);
}

fn render_note(out: &mut String, event: &Event, opts: &RenderOptions) {
    let source = event.source.as_deref().unwrap_or("event");
    let _ = writeln!(out, "**Event: {}**{}\n", source, event_suffix(event));
    render_text_and_extras(out, event, opts);
}

fn render_text_and_extras(out: &mut String, event: &Event, opts: &RenderOptions) {
    let text = event.text();
    if !text.is_empty() {
        let truncated = truncate_str(text, &opts.truncation());
        push_fenced(out, "text", truncated.trim_end());
    }
    if let Some(extras) = event.extras.as_ref().filter(|v| is_truthy(v)) {
        push_fenced(out, "json", &safe_json(extras));
    }
}

/// ` · <timestamp> · id=<n>` for whichever parts are present.
fn event_suffix(event: &Event) -> String {
    let mut suffix = String::new();
    if let Some(ts) = event.timestamp.as_deref().filter(|t| !t.is_empty()) {
        suffix.push_str(" · ");
        suffix.push_str(&format_timestamp(ts));
    }
    if let Some(id) = event.id {
        let _ = write!(suffix, " · id={}", id);
    }
    suffix
}

/// Normalise to UTC with a `Z` suffix. Offset-less timestamps are taken as
/// UTC; anything unparseable is returned verbatim.
pub fn format_timestamp(ts: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return utc_iso(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return utc_iso(naive.and_utc());
    }
    ts.to_string()
}

/// Six fractional digits when there are sub-second microseconds, none otherwise.
fn utc_iso(dt: DateTime<Utc>) -> String {
    let precision = if dt.timestamp_subsec_micros() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    dt.to_rfc3339_opts(precision, true)
}

fn push_fenced(out: &mut String, lang: &str, body: &str) {
    let fence = "`".repeat(longest_backtick_run(body).max(2) + 1);
    let _ = writeln!(out, "{}{}\n{}\n{}\n", fence, lang, body, fence);
}

fn inline_code(s: &str) -> String {
    let ticks = "`".repeat(longest_backtick_run(s) + 1);
    if s.starts_with('`') || s.ends_with('`') {
        format!("{} {} {}", ticks, s, ticks)
    } else {
        format!("{}{}{}", ticks, s, ticks)
    }
}

fn longest_backtick_run(s: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for c in s.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
