use crate::model::{
    events_from_values, json_kind, model_from_events, ConversationDetails, ConversationSummary,
    Event,
};
use crate::redact::redact;
use anyhow::Context;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://app.all-hands.dev";
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const SESSION_KEY_HEADER: &str = "X-Session-API-Key";

const BODY_PREFIX_BYTES: usize = 200;
const PROBE_WINDOW: u32 = 20;
const FIRST_MESSAGE_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status} for {url} (content-type={content_type:?} body_prefix={body_prefix:?})")]
    Status {
        url: String,
        status: u16,
        content_type: String,
        body_prefix: String,
    },

    #[error("non-JSON response for {url} (content-type={content_type:?} body_prefix={body_prefix:?})")]
    Parse {
        url: String,
        content_type: String,
        body_prefix: String,
    },

    #[error("unexpected payload shape from {url}: {detail}")]
    Shape { url: String, detail: String },
}

impl FetchError {
    /// Whether the runtime endpoint may be tried after this failure. A body
    /// that parsed but has the wrong shape is never retried elsewhere.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, FetchError::Shape { .. })
    }
}

/// Blocking GET returning parsed JSON.
pub trait Transport {
    fn get_json(&self, url: &str, session_key: Option<&str>) -> Result<Value, FetchError>;
}

/// reqwest-backed transport authenticating with a bearer API key.
pub struct HttpTransport {
    client: Client,
    api_key: String,
}

impl HttpTransport {
    pub fn new(api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(HttpTransport {
            client,
            api_key: api_key.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn get_json(&self, url: &str, session_key: Option<&str>) -> Result<Value, FetchError> {
        debug!("GET {}", url);

        let mut request = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json");
        if let Some(key) = session_key {
            request = request.header(SESSION_KEY_HEADER, key);
        }

        let transport_error = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = request.send().map_err(transport_error)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().map_err(transport_error)?;

        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                content_type,
                body_prefix: body_prefix(&body),
            });
        }

        serde_json::from_slice(&body).map_err(|_| FetchError::Parse {
            url: url.to_string(),
            content_type,
            body_prefix: body_prefix(&body),
        })
    }
}

fn body_prefix(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREFIX_BYTES);
    redact(&String::from_utf8_lossy(&body[..end]))
}

/// Conversation-scoped endpoint used when the management API is unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEndpoint {
    pub url: String,
    pub session_key: String,
}

impl RuntimeEndpoint {
    /// Present only when the details carry both a runtime URL and a session key.
    pub fn from_details(details: &ConversationDetails) -> Option<Self> {
        let url = details.url.as_deref().filter(|u| !u.trim().is_empty())?;
        let session_key = details
            .session_api_key
            .as_deref()
            .filter(|k| !k.is_empty())?;

        Some(RuntimeEndpoint {
            url: url.trim_end_matches('/').to_string(),
            session_key: session_key.to_string(),
        })
    }
}

/// One page of events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub has_more: bool,
    /// `id` of the last raw entry in the page, when it has one.
    pub last_id: Option<i64>,
    raw_len: usize,
}

impl EventPage {
    fn from_payload(url: &str, payload: Value) -> Result<Self, FetchError> {
        let shape_error = |detail: String| FetchError::Shape {
            url: url.to_string(),
            detail,
        };

        let mut body = match payload {
            Value::Object(body) => body,
            other => {
                return Err(shape_error(format!("expected an object, got {}", json_kind(&other))))
            }
        };

        let items = match body.remove("events") {
            Some(Value::Array(items)) => items,
            Some(other) => return Err(shape_error(format!("`events` is {}", json_kind(&other)))),
            None => return Err(shape_error("missing `events`".to_string())),
        };

        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        let last_id = items.last().and_then(|e| e.get("id")).and_then(Value::as_i64);
        let raw_len = items.len();

        Ok(EventPage {
            events: events_from_values(items, url),
            has_more,
            last_id,
            raw_len,
        })
    }

    /// True when the server returned no entries at all.
    pub fn is_empty(&self) -> bool {
        self.raw_len == 0
    }
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

/// Client for the conversation endpoints of the OpenHands Cloud API.
pub struct CloudClient<T> {
    transport: T,
    base_url: String,
    runtime: Option<RuntimeEndpoint>,
}

impl<T: Transport> CloudClient<T> {
    pub fn new(transport: T, base_url: &str) -> Self {
        CloudClient {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            runtime: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Runtime endpoint for event fetches; normally taken from the
    /// conversation details before paging starts.
    pub fn set_runtime(&mut self, runtime: Option<RuntimeEndpoint>) {
        self.runtime = runtime;
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<ConversationDetails, FetchError> {
        let url = format!(
            "{}/api/conversations/{}",
            self.base_url,
            urlencoding::encode(conversation_id)
        );
        match self.transport.get_json(&url, None)? {
            Value::Object(map) => Ok(ConversationDetails::from(map)),
            other => Err(FetchError::Shape {
                url,
                detail: format!("expected conversation details object, got {}", json_kind(&other)),
            }),
        }
    }

    /// Every conversation visible to the API key, following `next_page_id`
    /// until the server stops returning one.
    pub fn list_conversations(&self, limit: u32) -> Result<Vec<ConversationDetails>, FetchError> {
        let mut conversations = Vec::new();
        let mut page_id: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/api/conversations?limit={}",
                self.base_url,
                clamp_limit(limit)
            );
            if let Some(id) = &page_id {
                url.push_str("&page_id=");
                url.push_str(&urlencoding::encode(id));
            }

            let mut body = match self.transport.get_json(&url, None)? {
                Value::Object(body) => body,
                other => {
                    return Err(FetchError::Shape {
                        url,
                        detail: format!("expected an object, got {}", json_kind(&other)),
                    })
                }
            };

            let results = match body.remove("results") {
                Some(Value::Array(items)) => items,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(FetchError::Shape {
                        url,
                        detail: format!("`results` is {}", json_kind(&other)),
                    })
                }
            };
            for item in results {
                match item {
                    Value::Object(map) => conversations.push(ConversationDetails::from(map)),
                    other => warn!("Skipping {} entry in {} (not a mapping)", json_kind(&other), url),
                }
            }

            let next = body
                .get("next_page_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            match next {
                Some(next) if page_id.as_deref() == Some(next.as_str()) => {
                    warn!("Conversation list repeated page_id={}; stopping", next);
                    break;
                }
                Some(next) => page_id = Some(next),
                None => break,
            }
        }

        info!("Listed {} conversations", conversations.len());
        Ok(conversations)
    }

    /// Fetch one page of events, retrying once against the runtime endpoint
    /// when the primary request fails and a runtime endpoint is known.
    pub fn fetch_events(
        &self,
        conversation_id: &str,
        start_id: i64,
        limit: u32,
        reverse: bool,
    ) -> Result<EventPage, FetchError> {
        let query = format!(
            "start_id={}&limit={}&reverse={}",
            start_id,
            clamp_limit(limit),
            reverse
        );
        let url = format!(
            "{}/api/conversations/{}/events?{}",
            self.base_url,
            urlencoding::encode(conversation_id),
            query
        );

        let (url, payload) = match self.transport.get_json(&url, None) {
            Ok(payload) => (url, payload),
            Err(err) if err.allows_fallback() => {
                let Some(runtime) = &self.runtime else {
                    return Err(err);
                };
                warn!("Events request failed ({}); falling back to runtime {}", err, runtime.url);
                let runtime_url = format!("{}/events?{}", runtime.url, query);
                let payload = self
                    .transport
                    .get_json(&runtime_url, Some(&runtime.session_key))?;
                (runtime_url, payload)
            }
            Err(err) => return Err(err),
        };

        EventPage::from_payload(&url, payload)
    }

    /// Lazily iterate every event from `start_id` onwards, page by page.
    pub fn iterate_events<'a>(
        &'a self,
        conversation_id: &'a str,
        start_id: i64,
        limit: u32,
        delay: Option<Duration>,
    ) -> EventIter<'a, T> {
        EventIter {
            client: self,
            conversation_id,
            next_start: start_id,
            limit: clamp_limit(limit),
            delay: delay.filter(|d| !d.is_zero()),
            buffer: Vec::new().into_iter(),
            pages_fetched: 0,
            done: false,
        }
    }

    pub fn last_event_id(&self, conversation_id: &str) -> Result<Option<i64>, FetchError> {
        let page = self.fetch_events(conversation_id, 0, 1, true)?;
        Ok(page.events.first().and_then(|e| e.id))
    }

    pub fn recent_model(&self, conversation_id: &str) -> Result<Option<String>, FetchError> {
        let page = self.fetch_events(conversation_id, 0, PROBE_WINDOW, true)?;
        Ok(model_from_events(&page.events))
    }

    pub fn early_model(&self, conversation_id: &str) -> Result<Option<String>, FetchError> {
        let page = self.fetch_events(conversation_id, 0, PROBE_WINDOW, false)?;
        Ok(model_from_events(&page.events))
    }

    pub fn first_user_message(&self, conversation_id: &str) -> Result<Option<String>, FetchError> {
        let page = self.fetch_events(conversation_id, 0, PROBE_WINDOW, false)?;
        // `message` wins whenever it is non-empty, even if only whitespace
        let message = page
            .events
            .iter()
            .filter(|e| e.source.as_deref() == Some("user"))
            .find_map(|e| {
                [e.message.as_deref(), e.content.as_deref()]
                    .into_iter()
                    .flatten()
                    .find(|s| !s.is_empty())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            });
        Ok(message.map(str::to_string))
    }

    /// Details plus a few small event probes. Uses the runtime endpoint from
    /// the details as fallback for the probes.
    pub fn conversation_summary(&mut self, conversation_id: &str) -> Result<ConversationSummary, FetchError> {
        let details = self.get_conversation(conversation_id)?;
        let runtime = RuntimeEndpoint::from_details(&details);
        let has_runtime = runtime.is_some();
        self.set_runtime(runtime);

        let last_event_id = self.last_event_id(conversation_id)?;
        let model = match self.recent_model(conversation_id)? {
            Some(model) => Some(model),
            None => self.early_model(conversation_id)?,
        };
        let first_message = self
            .first_user_message(conversation_id)?
            .map(|m| m.chars().take(FIRST_MESSAGE_PREVIEW_CHARS).collect());

        Ok(ConversationSummary {
            conversation_id: conversation_id.to_string(),
            title: details.title,
            status: details.status,
            runtime_status: details.runtime_status,
            created_at: details.created_at,
            last_updated_at: details.last_updated_at,
            repository: details.selected_repository,
            branch: details.selected_branch,
            event_count: last_event_id.map(|id| id + 1).unwrap_or(0),
            model,
            first_message,
            url: details.url,
            has_runtime,
        })
    }
}

/// Forward-only iterator over a conversation's events. Yields an error at most
/// once, after which it is exhausted.
pub struct EventIter<'a, T> {
    client: &'a CloudClient<T>,
    conversation_id: &'a str,
    next_start: i64,
    limit: u32,
    delay: Option<Duration>,
    buffer: std::vec::IntoIter<Event>,
    pages_fetched: usize,
    done: bool,
}

impl<T> EventIter<'_, T> {
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl<T: Transport> Iterator for EventIter<'_, T> {
    type Item = Result<Event, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.next() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }

            if self.pages_fetched > 0 {
                if let Some(delay) = self.delay {
                    thread::sleep(delay);
                }
            }

            let page = match self.client.fetch_events(
                self.conversation_id,
                self.next_start,
                self.limit,
                false,
            ) {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.pages_fetched += 1;

            if page.is_empty() {
                self.done = true;
                return None;
            }
            info!(
                "Fetched page {} ({} events from start_id={})",
                self.pages_fetched,
                page.events.len(),
                self.next_start
            );

            let next_start = match page.last_id {
                Some(id) => id.checked_add(1).unwrap_or_else(|| {
                    warn!("Event id {} is at the id ceiling; no further pages", id);
                    self.next_start
                }),
                None => {
                    warn!(
                        "Last event in page from start_id={} has no id; reusing start_id",
                        self.next_start
                    );
                    self.next_start
                }
            };

            if !page.has_more {
                self.done = true;
            } else if next_start <= self.next_start {
                warn!(
                    "Event cursor did not advance past start_id={}; stopping pagination",
                    self.next_start
                );
                self.done = true;
            }

            self.next_start = next_start;
            self.buffer = page.events.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Serves `events` like the real endpoint: ids >= start_id, `limit` at a time.
    struct PagedTransport {
        events: Vec<Value>,
        calls: RefCell<Vec<String>>,
    }

    impl PagedTransport {
        fn with_ids(ids: &[i64]) -> Self {
            PagedTransport {
                events: ids
                    .iter()
                    .map(|id| json!({"id": id, "source": "agent", "action": "run"}))
                    .collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    fn query_param(url: &str, name: &str) -> String {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
            .unwrap_or_default()
    }

    impl Transport for PagedTransport {
        fn get_json(&self, url: &str, _session_key: Option<&str>) -> Result<Value, FetchError> {
            self.calls.borrow_mut().push(url.to_string());
            let start: i64 = query_param(url, "start_id").parse().unwrap();
            let limit: usize = query_param(url, "limit").parse().unwrap();
            let remaining: Vec<Value> = self
                .events
                .iter()
                .filter(|e| e["id"].as_i64().unwrap() >= start)
                .cloned()
                .collect();
            let page: Vec<Value> = remaining.iter().take(limit).cloned().collect();
            Ok(json!({"events": page, "has_more": remaining.len() > limit}))
        }
    }

    /// Replays canned responses and records (url, session key) per call.
    struct ScriptedTransport {
        responses: RefCell<VecDeque<Result<Value, FetchError>>>,
        calls: RefCell<Vec<(String, Option<String>)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Value, FetchError>>) -> Self {
            ScriptedTransport {
                responses: RefCell::new(responses.into()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn get_json(&self, url: &str, session_key: Option<&str>) -> Result<Value, FetchError> {
            self.calls
                .borrow_mut()
                .push((url.to_string(), session_key.map(str::to_string)));
            self.responses
                .borrow_mut()
                .pop_front()
                .expect("unexpected extra request")
        }
    }

    fn maintenance_page(url: &str) -> FetchError {
        FetchError::Parse {
            url: url.to_string(),
            content_type: "text/html".to_string(),
            body_prefix: "<html>".to_string(),
        }
    }

    fn runtime() -> Option<RuntimeEndpoint> {
        Some(RuntimeEndpoint {
            url: "https://rt.example".to_string(),
            session_key: "sess-1".to_string(),
        })
    }

    #[test]
    fn test_iterate_preserves_order_across_gappy_pages() {
        let ids = [0, 1, 2, 5, 6, 9, 10, 14, 15, 20];
        let client = CloudClient::new(PagedTransport::with_ids(&ids), "https://app.example/");
        let got: Vec<i64> = client
            .iterate_events("c1", 0, 3, None)
            .map(|e| e.unwrap().id.unwrap())
            .collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn test_iterate_fetch_count() {
        for (total, limit, expected_pages) in [(10, 3, 4), (9, 3, 3), (1, 100, 1), (250, 100, 3)] {
            let ids: Vec<i64> = (0..total).collect();
            let client = CloudClient::new(PagedTransport::with_ids(&ids), "https://app.example");
            let mut iter = client.iterate_events("c1", 0, limit, None);
            let count = iter.by_ref().count();
            assert_eq!(count, total as usize);
            assert_eq!(iter.pages_fetched(), expected_pages, "total={total} limit={limit}");
        }
    }

    #[test]
    fn test_iterate_empty_conversation() {
        let client = CloudClient::new(PagedTransport::with_ids(&[]), "https://app.example");
        let mut iter = client.iterate_events("c1", 0, 100, None);
        assert!(iter.next().is_none());
        assert_eq!(iter.pages_fetched(), 1);
    }

    #[test]
    fn test_iterate_starts_from_cursor() {
        let client = CloudClient::new(PagedTransport::with_ids(&[1, 2, 3, 4]), "https://app.example");
        let got: Vec<i64> = client
            .iterate_events("c1", 3, 100, None)
            .map(|e| e.unwrap().id.unwrap())
            .collect();
        assert_eq!(got, vec![3, 4]);
        assert!(client.transport.calls.borrow()[0].contains("start_id=3&limit=100&reverse=false"));
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(1000), 100);

        let transport = ScriptedTransport::new(vec![Ok(json!({"events": []}))]);
        let client = CloudClient::new(transport, "https://app.example");
        client.fetch_events("c1", 0, 500, true).unwrap();
        let calls = client.transport.calls.borrow();
        assert_eq!(
            calls[0].0,
            "https://app.example/api/conversations/c1/events?start_id=0&limit=100&reverse=true"
        );
    }

    #[test]
    fn test_last_page_with_has_more_false_stops() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"events": [{"id": 0}, {"id": 1}], "has_more": true})),
            Ok(json!({"events": [{"id": 2}], "has_more": false})),
        ]);
        let client = CloudClient::new(transport, "https://app.example");
        let got: Vec<_> = client.iterate_events("c1", 0, 2, None).collect();
        assert_eq!(got.len(), 3);
        let calls = client.transport.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0.contains("start_id=2&"));
    }

    #[test]
    fn test_missing_id_does_not_loop() {
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "events": [{"id": 0}, {"source": "agent"}],
            "has_more": true
        }))]);
        let client = CloudClient::new(transport, "https://app.example");
        let got: Vec<_> = client.iterate_events("c1", 0, 2, None).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(client.transport.calls.borrow().len(), 1);
    }

    #[test]
    fn test_id_at_ceiling_stops_paging() {
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "events": [{"id": i64::MAX}],
            "has_more": true
        }))]);
        let client = CloudClient::new(transport, "https://app.example");
        let got: Vec<i64> = client
            .iterate_events("c1", 0, 1, None)
            .map(|e| e.unwrap().id.unwrap())
            .collect();
        assert_eq!(got, vec![i64::MAX]);
        assert_eq!(client.transport.calls.borrow().len(), 1);
    }

    #[test]
    fn test_delay_only_between_pages() {
        let delay = Duration::from_millis(150);
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"events": [{"id": 0}], "has_more": true})),
            Ok(json!({"events": [{"id": 1}], "has_more": false})),
        ]);
        let client = CloudClient::new(transport, "https://app.example");

        let started = Instant::now();
        let mut iter = client.iterate_events("c1", 0, 1, Some(delay));
        assert_eq!(iter.next().unwrap().unwrap().id, Some(0));
        assert!(started.elapsed() < delay, "slept before the first fetch");

        let rest: Vec<i64> = iter.by_ref().map(|e| e.unwrap().id.unwrap()).collect();
        assert_eq!(rest, vec![1]);
        assert!(started.elapsed() >= delay);
        assert_eq!(iter.pages_fetched(), 2);
        assert_eq!(client.transport.calls.borrow().len(), 2);
    }

    #[test]
    fn test_first_user_message_skips_blank_message() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"events": [
            {"id": 0, "source": "user", "message": "   ", "content": "not used"},
            {"id": 1, "source": "user", "content": "  second  "}
        ]}))]);
        let client = CloudClient::new(transport, "https://app.example");
        assert_eq!(client.first_user_message("c1").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_list_conversations_follows_page_ids() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"results": [{"conversation_id": "a"}, "junk"], "next_page_id": "p 2"})),
            Ok(json!({"results": [{"conversation_id": "b"}], "next_page_id": null})),
        ]);
        let client = CloudClient::new(transport, "https://app.example");

        let ids: Vec<String> = client
            .list_conversations(500)
            .unwrap()
            .into_iter()
            .filter_map(|c| c.conversation_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let calls = client.transport.calls.borrow();
        assert_eq!(calls[0].0, "https://app.example/api/conversations?limit=100");
        assert_eq!(calls[1].0, "https://app.example/api/conversations?limit=100&page_id=p%202");
    }

    #[test]
    fn test_list_conversations_stops_on_repeated_page_id() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"results": [{"conversation_id": "a"}], "next_page_id": "p2"})),
            Ok(json!({"results": [], "next_page_id": "p2"})),
        ]);
        let client = CloudClient::new(transport, "https://app.example");
        assert_eq!(client.list_conversations(10).unwrap().len(), 1);
        assert_eq!(client.transport.calls.borrow().len(), 2);

        let transport = ScriptedTransport::new(vec![Ok(json!({"results": {"a": 1}}))]);
        let client = CloudClient::new(transport, "https://app.example");
        assert!(matches!(client.list_conversations(10), Err(FetchError::Shape { .. })));
    }

    #[test]
    fn test_non_object_entries_skipped() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({"events": ["junk"], "has_more": true})),
            Ok(json!({"events": [{"id": 4}], "has_more": false})),
        ]);
        let client = CloudClient::new(transport, "https://app.example");
        // the skipped entry carries no id, so the cursor stalls and paging stops
        let got: Vec<_> = client.iterate_events("c1", 4, 1, None).collect();
        assert!(got.is_empty());
        assert_eq!(client.transport.calls.borrow().len(), 1);
    }

    #[test]
    fn test_fallback_to_runtime_on_primary_failure() {
        let transport = ScriptedTransport::new(vec![
            Err(maintenance_page("primary")),
            Ok(json!({"events": [{"id": 0, "source": "user"}], "has_more": false})),
        ]);
        let mut client = CloudClient::new(transport, "https://app.example");
        client.set_runtime(runtime());

        let page = client.fetch_events("c1", 0, 100, false).unwrap();
        assert_eq!(page.events.len(), 1);

        let calls = client.transport.calls.borrow();
        assert_eq!(calls[0].1, None);
        assert_eq!(
            calls[1],
            (
                "https://rt.example/events?start_id=0&limit=100&reverse=false".to_string(),
                Some("sess-1".to_string())
            )
        );
    }

    #[test]
    fn test_error_propagates_without_runtime() {
        let transport = ScriptedTransport::new(vec![Err(FetchError::Status {
            url: "primary".to_string(),
            status: 503,
            content_type: "text/html".to_string(),
            body_prefix: String::new(),
        })]);
        let client = CloudClient::new(transport, "https://app.example");

        let mut iter = client.iterate_events("c1", 0, 100, None);
        let err = iter.next().unwrap().unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert!(iter.next().is_none());
        assert_eq!(client.transport.calls.borrow().len(), 1);
    }

    #[test]
    fn test_runtime_failure_is_reported() {
        let transport = ScriptedTransport::new(vec![
            Err(maintenance_page("primary")),
            Err(FetchError::Transport {
                url: "runtime".to_string(),
                message: "connection refused".to_string(),
            }),
        ]);
        let mut client = CloudClient::new(transport, "https://app.example");
        client.set_runtime(runtime());
        let err = client.fetch_events("c1", 0, 100, false).unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
    }

    #[test]
    fn test_malformed_page_is_fatal_and_not_retried() {
        for payload in [json!([1, 2]), json!({"has_more": true}), json!({"events": "nope"})] {
            let transport = ScriptedTransport::new(vec![Ok(payload)]);
            let mut client = CloudClient::new(transport, "https://app.example");
            client.set_runtime(runtime());
            let err = client.fetch_events("c1", 0, 100, false).unwrap_err();
            assert!(matches!(err, FetchError::Shape { .. }));
            assert!(!err.allows_fallback());
            assert_eq!(client.transport.calls.borrow().len(), 1);
        }
    }

    #[test]
    fn test_runtime_endpoint_requires_url_and_key() {
        let details = |v: Value| -> ConversationDetails { serde_json::from_value(v).unwrap() };
        assert_eq!(
            RuntimeEndpoint::from_details(&details(json!({"url": "https://rt/", "session_api_key": "k"}))),
            Some(RuntimeEndpoint {
                url: "https://rt".to_string(),
                session_key: "k".to_string()
            })
        );
        assert!(RuntimeEndpoint::from_details(&details(json!({"url": "https://rt"}))).is_none());
        assert!(RuntimeEndpoint::from_details(&details(json!({"url": null, "session_api_key": "k"}))).is_none());
        assert!(RuntimeEndpoint::from_details(&details(json!({"url": "", "session_api_key": "k"}))).is_none());
    }

    #[test]
    fn test_conversation_details_must_be_object() {
        let transport = ScriptedTransport::new(vec![Ok(json!(["x"]))]);
        let client = CloudClient::new(transport, "https://app.example");
        assert!(matches!(client.get_conversation("a b"), Err(FetchError::Shape { .. })));
        assert_eq!(
            client.transport.calls.borrow()[0].0,
            "https://app.example/api/conversations/a%20b"
        );
    }

    #[test]
    fn test_conversation_summary() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({
                "conversation_id": "c1", "title": "T", "status": "RUNNING",
                "selected_repository": "o/r", "url": "https://rt", "session_api_key": "k"
            })),
            Ok(json!({"events": [{"id": 41}], "has_more": true})),
            Ok(json!({"events": [{"id": 41}, {"id": 40}], "has_more": true})),
            Ok(json!({"events": [{"id": 0, "tool_call_metadata": {"model_response": {"model": "m-1"}}}]})),
            Ok(json!({"events": [
                {"id": 0, "source": "environment", "message": "ready"},
                {"id": 1, "source": "user", "message": "  ", "content": "shadowed"},
                {"id": 2, "source": "user", "message": "", "content": "  fix it  "}
            ]})),
        ]);
        let mut client = CloudClient::new(transport, "https://app.example");
        let summary = client.conversation_summary("c1").unwrap();

        assert_eq!(summary.event_count, 42);
        assert_eq!(summary.model.as_deref(), Some("m-1"));
        assert_eq!(summary.first_message.as_deref(), Some("fix it"));
        assert_eq!(summary.repository.as_deref(), Some("o/r"));
        assert!(summary.has_runtime);
        assert_eq!(client.transport.calls.borrow().len(), 5);
    }

    #[test]
    fn test_http_transport_errors() {
        let mut server = mockito::Server::new();
        let html = server
            .mock("GET", "/ok-but-html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>maintenance</html>")
            .create();
        let down = server
            .mock("GET", "/down")
            .with_status(502)
            .with_header("content-type", "text/plain")
            .with_body("Authorization: Bearer leaked-token")
            .create();

        let transport = HttpTransport::new("key-1", Duration::from_secs(5)).unwrap();

        let err = transport
            .get_json(&format!("{}/ok-but-html", server.url()), None)
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
        assert!(err.to_string().contains("text/html"));

        let err = transport.get_json(&format!("{}/down", server.url()), None).unwrap_err();
        match &err {
            FetchError::Status { status, body_prefix, .. } => {
                assert_eq!(*status, 502);
                assert_eq!(body_prefix, "Authorization: Bearer <redacted>");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        html.assert();
        down.assert();
    }

    #[test]
    fn test_http_fallback_sends_session_key() {
        let mut server = mockito::Server::new();
        let primary = server
            .mock("GET", "/api/conversations/c1/events")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "Bearer key-1")
            .with_status(503)
            .with_body("<html>down for maintenance</html>")
            .create();
        let runtime = server
            .mock("GET", "/runtime/events")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("start_id".into(), "0".into()),
                mockito::Matcher::UrlEncoded("limit".into(), "100".into()),
            ]))
            .match_header("authorization", "Bearer key-1")
            .match_header("x-session-api-key", "sess-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"events": [{"id": 0, "source": "user"}, {"id": 1}], "has_more": false}"#)
            .create();

        let transport = HttpTransport::new("key-1", Duration::from_secs(5)).unwrap();
        let mut client = CloudClient::new(transport, &server.url());
        client.set_runtime(Some(RuntimeEndpoint {
            url: format!("{}/runtime", server.url()),
            session_key: "sess-1".to_string(),
        }));

        let events: Vec<Event> = client
            .iterate_events("c1", 0, 100, None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.len(), 2);

        primary.assert();
        runtime.assert();
    }
}
