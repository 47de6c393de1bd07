use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dw_plugin::error::PluginError;
use dw_plugin::event::{BusEvent, EventHandler};
use dw_plugin::repository::{DEFAULT_EVENT_VERSION, EventQuery, EventRepository, StoredEvent};
use serde_json::Value;
use tokio::sync::RwLock;

/// Reference [`EventRepository`] kept in memory.
///
/// With a retention cap only the newest `retention` saved events are kept;
/// `0` keeps everything. Evicted ids may be saved again.
#[derive(Default)]
pub struct MemoryEventRepository {
    inner: RwLock<Stored>,
    retention: usize,
}

#[derive(Default)]
struct Stored {
    events: VecDeque<StoredEvent>,
    ids: HashSet<String>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self { retention, ..Self::default() }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.events.is_empty()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn save(&self, event: StoredEvent) -> Result<(), PluginError> {
        let mut stored = self.inner.write().await;
        if stored.ids.contains(&event.id) {
            return Err(PluginError::AlreadyExists(format!("event {}", event.id)));
        }
        stored.ids.insert(event.id.clone());
        stored.events.push_back(event);
        while self.retention > 0 && stored.events.len() > self.retention {
            if let Some(old) = stored.events.pop_front() {
                stored.ids.remove(&old.id);
            }
        }
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, PluginError> {
        let stored = self.inner.read().await;
        let mut hits: Vec<StoredEvent> = stored.events.iter().filter(|e| query.matches(e)).cloned().collect();
        if query.order_by_time {
            hits.sort_by_key(|e| e.timestamp);
        } else {
            hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        let iter = hits.into_iter().skip(query.offset);
        Ok(if query.limit > 0 { iter.take(query.limit).collect() } else { iter.collect() })
    }
}

/// Bus handler that stores every event it sees.
pub struct EventRecorder {
    repository: Arc<dyn EventRepository>,
}

impl EventRecorder {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: BusEvent) -> anyhow::Result<()> {
        self.repository.save(to_stored(event)).await?;
        Ok(())
    }
}

/// Labels become the filterable metadata; the payload is kept as JSON when
/// it parses and as text otherwise.
pub fn to_stored(event: BusEvent) -> StoredEvent {
    let payload = event
        .payload_json()
        .unwrap_or_else(|| Value::String(String::from_utf8_lossy(&event.payload).into_owned()));
    let version = event
        .metadata
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_EVENT_VERSION)
        .to_string();
    let content = searchable_text(&event.event_type, &payload);
    StoredEvent {
        id: event.id,
        timestamp: event.timestamp.unwrap_or_else(Utc::now),
        event_type: event.event_type,
        source: event.source,
        metadata: event.labels,
        payload,
        content,
        version,
    }
}

// type plus every string leaf of the payload, space separated
fn searchable_text(event_type: &str, payload: &Value) -> String {
    fn collect<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
        match value {
            Value::String(s) if !s.is_empty() => out.push(s),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut parts = vec![event_type];
    collect(payload, &mut parts);
    parts.join(" ")
}
