use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A pub/sub message exchanged through the [`EventBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Assigned by the bus when empty.
    #[serde(default)]
    pub id: String,
    /// Dot-namespaced, e.g. `gmail.email_received`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    /// Assigned by the bus when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Routing keys, matched by [`EventFilter::labels`].
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Context only, never used for routing.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: None,
            labels: HashMap::new(),
            metadata: Map::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_json_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(payload)?;
        Ok(self)
    }

    /// Payload decoded as JSON, if it is JSON.
    pub fn payload_json(&self) -> Option<Value> {
        if self.payload.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Subscription predicate. Every specified part must match:
///
/// * `type_pattern`: glob over the event type. Empty or `*` matches anything,
///   `*` matches any run of characters (dots included), `?` matches one.
/// * `labels`: each key must be present on the event with an equal value.
/// * `source`: exact match when non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub type_pattern: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub source: String,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_type(pattern: impl Into<String>) -> Self {
        Self::new().type_pattern(pattern)
    }

    pub fn type_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.type_pattern = pattern.into();
        self.compiled = OnceLock::new();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        self.matches_type(&event.event_type)
            && self.matches_labels(&event.labels)
            && (self.source.is_empty() || self.source == event.source)
    }

    pub fn matches_type(&self, event_type: &str) -> bool {
        let pattern = self.type_pattern.as_str();
        if pattern.is_empty() || pattern == "*" {
            return true;
        }
        match self.compiled.get_or_init(|| glob_regex(pattern)) {
            Some(re) => re.is_match(event_type),
            None => pattern == event_type,
        }
    }

    fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
    #[error("event has no type")]
    MissingType,
    #[error("replay requested but the bus has no event log")]
    NoEventLog,
    #[error("event log: {0}")]
    Log(String),
}

/// Receives matching events. Errors are logged by the bus and go nowhere else.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// In-process publish/subscribe router.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the id the event was published under. Never waits on handlers.
    async fn publish(&self, event: BusEvent) -> Result<String, BusError>;

    async fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Result<String, BusError>;

    /// Idempotent; `true` if a live subscription was removed.
    async fn unsubscribe(&self, subscription_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(t: &str) -> BusEvent {
        BusEvent::new(t, "gmail")
    }

    #[test]
    fn empty_and_star_match_everything() {
        assert!(EventFilter::new().matches(&ev("anything.at.all")));
        assert!(EventFilter::for_type("*").matches(&ev("x")));
    }

    #[test]
    fn star_matches_within_a_segment() {
        let f = EventFilter::for_type("gmail.*");
        assert!(f.matches(&ev("gmail.email_received")));
        assert!(!f.matches(&ev("calendar.email_received")));
        assert!(!f.matches(&ev("gmail")));
    }

    #[test]
    fn star_also_crosses_dots() {
        let f = EventFilter::for_type("gmail.*");
        assert!(f.matches(&ev("gmail.inbox.email_received")));
        let g = EventFilter::for_type("*.received");
        assert!(g.matches(&ev("gmail.inbox.received")));
    }

    #[test]
    fn question_mark_and_literals() {
        assert!(EventFilter::for_type("task.?").matches(&ev("task.x")));
        assert!(!EventFilter::for_type("task.?").matches(&ev("task.xy")));
        // regex metacharacters are literal
        assert!(!EventFilter::for_type("a+b").matches(&ev("aab")));
        assert!(EventFilter::for_type("a+b").matches(&ev("a+b")));
        assert!(EventFilter::for_type("note.updated").matches(&ev("note.updated")));
    }

    #[test]
    fn labels_are_a_subset_match() {
        let e = ev("gmail.email_received").with_label("category", "school").with_label("unread", "true");
        assert!(EventFilter::new().label("category", "school").matches(&e));
        assert!(!EventFilter::new().label("category", "work").matches(&e));
        assert!(!EventFilter::new().label("folder", "inbox").matches(&e));
    }

    #[test]
    fn source_is_exact() {
        let e = ev("gmail.email_received");
        assert!(EventFilter::new().source("gmail").matches(&e));
        assert!(!EventFilter::new().source("gmai").matches(&e));
    }

    #[test]
    fn json_payload_helpers() {
        let e = ev("x").with_json_payload(&serde_json::json!({"k": 1})).unwrap();
        assert_eq!(e.payload_json().unwrap()["k"], 1);
        assert!(ev("x").payload_json().is_none());
    }
}
