use crate::model::Event;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// User or agent authored text.
    Chat,
    /// A tool call: any action other than a chat message.
    Invocation,
    /// The result of a tool call.
    Observation,
    /// Not noise, but neither a call nor a result (e.g. an empty message action).
    Note,
    Noise,
}

impl EventKind {
    pub fn is_tool_activity(self) -> bool {
        matches!(
            self,
            EventKind::Invocation | EventKind::Observation | EventKind::Note
        )
    }
}

pub fn is_chat_message(event: &Event) -> bool {
    matches!(event.source.as_deref(), Some("user" | "agent"))
        && event.action.as_deref() == Some("message")
        && !event.text().trim().is_empty()
}

/// Internal bookkeeping events with nothing to show in a transcript.
pub fn is_noise(event: &Event) -> bool {
    let action = event.action.as_deref();
    match event.source.as_deref() {
        Some("environment") => {
            event.observation.as_deref() == Some("agent_state_changed")
                || action == Some("change_agent_state")
                || (event.observation.is_none() && event.text().is_empty())
        }
        Some("user") => action == Some("recall"),
        Some("agent") => action == Some("system"),
        _ => false,
    }
}

pub fn classify(event: &Event) -> EventKind {
    if is_noise(event) {
        EventKind::Noise
    } else if is_chat_message(event) {
        EventKind::Chat
    } else if event.action.as_deref().is_some_and(|a| a != "message") {
        EventKind::Invocation
    } else if event.observation.is_some() {
        EventKind::Observation
    } else {
        EventKind::Note
    }
}

/// Tool calls by event id, for resolving an observation's `cause`.
pub struct ToolCallIndex<'a> {
    calls: HashMap<i64, &'a Event>,
}

impl<'a> ToolCallIndex<'a> {
    pub fn build(events: &'a [Event]) -> Self {
        let calls = events
            .iter()
            .filter(|e| e.action.as_deref().is_some_and(|a| a != "message"))
            .filter_map(|e| e.id.map(|id| (id, e)))
            .collect();
        ToolCallIndex { calls }
    }

    pub fn get(&self, id: i64) -> Option<&'a Event> {
        self.calls.get(&id).copied()
    }

    /// Action name of the call that produced `observation`, if known.
    pub fn cause_action(&self, observation: &Event) -> Option<&'a str> {
        self.get(observation.cause?)?.action.as_deref()
    }

    /// Number of indexed calls, for diagnostics.
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}
