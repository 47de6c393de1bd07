use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Framework event as kept by an [`EventRepository`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub payload: Value,
    /// Normalized text used for full-text search.
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    DEFAULT_EVENT_VERSION.to_string()
}

/// Query criteria. Every set field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Inclusive.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Equality on every listed key.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub search_text: String,
    /// Oldest first when set, newest first otherwise.
    #[serde(default)]
    pub order_by_time: bool,
    /// 0 means no limit.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl EventQuery {
    /// Everything but ordering and pagination.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if self.start_time.is_some_and(|t| event.timestamp < t) {
            return false;
        }
        if self.end_time.is_some_and(|t| event.timestamp > t) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == &event.event_type) {
            return false;
        }
        if !self
            .metadata
            .iter()
            .all(|(k, v)| event.metadata.get(k).is_some_and(|actual| actual == v))
        {
            return false;
        }
        if !self.search_text.is_empty() {
            let needle = self.search_text.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Durable, queryable, append-only event store.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn save(&self, event: StoredEvent) -> Result<(), PluginError>;
    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, PluginError>;
}
