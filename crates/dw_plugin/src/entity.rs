use std::collections::HashMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{Capability, CapabilitySet};
use crate::error::PluginError;

/// Minimal read contract every host-visible record satisfies.
///
/// Optional views are reached through the `as_*` accessors, which must return
/// `Some` exactly when the matching tag is in [`Entity::capabilities`].
pub trait Entity: Send + Sync + Debug {
    fn id(&self) -> &str;
    fn entity_type(&self) -> &str;
    fn capabilities(&self) -> CapabilitySet;

    /// Full field map. Point lookups through [`Entity::field`] agree with it.
    fn fields(&self) -> Map<String, Value>;

    fn field(&self, name: &str) -> Option<Value> {
        self.fields().get(name).cloned()
    }

    fn as_trackable(&self) -> Option<&dyn Trackable> {
        None
    }

    fn as_contextual(&self) -> Option<&dyn Contextual> {
        None
    }
}

/// Progress/status view.
pub trait Trackable {
    fn status(&self) -> String;
    /// 0.0 ..= 1.0
    fn progress(&self) -> f64;
    fn is_blocked(&self) -> bool;
    fn block_reason(&self) -> Option<String>;
}

/// Relationship/context view.
pub trait Contextual {
    fn context(&self) -> EntityContext;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    /// relation name → entity ids
    #[serde(default)]
    pub related_entities: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub linked_files: Vec<String>,
    #[serde(default)]
    pub recent_activity: Vec<ActivityRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actor: String,
}

/// Serialized form used on the wire: the field map plus `id`, `type` and
/// `capabilities`.
pub fn to_wire(entity: &dyn Entity) -> Value {
    let mut map = entity.fields();
    map.insert("id".into(), Value::String(entity.id().to_string()));
    map.insert("type".into(), Value::String(entity.entity_type().to_string()));
    map.insert(
        "capabilities".into(),
        Value::Array(entity.capabilities().iter().map(|t| Value::String(t.to_string())).collect()),
    );
    Value::Object(map)
}

/// Generic entity backed by a JSON object.
///
/// This is what subprocess plugins hand back, and a convenient base for
/// in-process plugins that don't need their own struct. The trackable and
/// contextual views read well-known fields (`status`, `progress`,
/// `is_blocked`, `block_reason`, `related_entities`, `linked_files`,
/// `recent_activity`, `metadata`) and are only exposed when tagged.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    id: String,
    entity_type: String,
    capabilities: CapabilitySet,
    fields: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            capabilities: CapabilitySet::new().with(Capability::Extensible),
            fields: Map::new(),
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap.tag());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_field(name, value);
        self
    }

    /// `id` and `type` are identity, not data; writes to them are ignored.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if matches!(name.as_str(), "id" | "type" | "capabilities") {
            return;
        }
        self.fields.insert(name, value);
    }

    /// Decode the wire form. `id` and `type` are required.
    pub fn from_json(value: Value) -> Result<Self, PluginError> {
        let Value::Object(mut map) = value else {
            return Err(PluginError::Internal("entity is not a JSON object".into()));
        };
        let id = match map.remove("id") {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(PluginError::Internal("entity has no id".into())),
        };
        let entity_type = match map.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(PluginError::Internal(format!("entity {id} has no type"))),
        };
        let capabilities = match map.remove("capabilities") {
            Some(Value::Array(tags)) => tags.iter().filter_map(Value::as_str).collect(),
            _ => CapabilitySet::new(),
        };
        Ok(Self { id, entity_type, capabilities, fields: map })
    }

    fn str_field(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(Value::as_str).map(str::to_string)
    }
}

impl Entity for EntityRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn fields(&self) -> Map<String, Value> {
        let mut all = self.fields.clone();
        all.insert("id".into(), Value::String(self.id.clone()));
        all.insert("type".into(), Value::String(self.entity_type.clone()));
        all
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.entity_type.clone())),
            _ => self.fields.get(name).cloned(),
        }
    }

    fn as_trackable(&self) -> Option<&dyn Trackable> {
        self.capabilities.has(Capability::Trackable).then_some(self as &dyn Trackable)
    }

    fn as_contextual(&self) -> Option<&dyn Contextual> {
        self.capabilities.has(Capability::HasContext).then_some(self as &dyn Contextual)
    }
}

impl Trackable for EntityRecord {
    fn status(&self) -> String {
        self.str_field("status").unwrap_or_default()
    }

    fn progress(&self) -> f64 {
        self.fields
            .get("progress")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }

    fn is_blocked(&self) -> bool {
        self.fields.get("is_blocked").and_then(Value::as_bool).unwrap_or(false)
    }

    fn block_reason(&self) -> Option<String> {
        self.str_field("block_reason").filter(|r| !r.is_empty())
    }
}

impl Contextual for EntityRecord {
    fn context(&self) -> EntityContext {
        let pick = |name: &str| self.fields.get(name).cloned();
        EntityContext {
            related_entities: pick("related_entities")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            linked_files: pick("linked_files")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            recent_activity: pick("recent_activity")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            metadata: match pick("metadata") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn point_lookup_agrees_with_full_map() {
        let e = EntityRecord::new("note-1", "note")
            .with_field("title", json!("Example"))
            .with_field("tags", json!(["a", "b"]));
        for (k, v) in e.fields() {
            assert_eq!(e.field(&k), Some(v), "field {k}");
        }
        assert_eq!(e.field("missing"), None);
    }

    #[test]
    fn wire_form_roundtrips_identity_and_tags() {
        let raw = json!({
            "id": "task-1", "type": "task", "capabilities": ["ITrackable"],
            "status": "in-progress", "progress": 0.5
        });
        let e = EntityRecord::from_json(raw).unwrap();
        assert_eq!(e.id(), "task-1");
        assert!(e.capabilities().has(Capability::Trackable));
        let back = to_wire(&e);
        assert_eq!(back["status"], json!("in-progress"));
        assert_eq!(back["capabilities"], json!(["ITrackable"]));
    }

    #[test]
    fn optional_views_follow_tags() {
        let plain = EntityRecord::new("n", "note").with_field("status", json!("done"));
        assert!(plain.as_trackable().is_none());
        assert!(plain.as_contextual().is_none());

        let tracked = EntityRecord::new("t", "task")
            .with_capability(Capability::Trackable)
            .with_field("status", json!("blocked"))
            .with_field("progress", json!(1.7))
            .with_field("is_blocked", json!(true))
            .with_field("block_reason", json!("waiting on review"));
        let t = tracked.as_trackable().unwrap();
        assert_eq!(t.status(), "blocked");
        assert_eq!(t.progress(), 1.0);
        assert!(t.is_blocked());
        assert_eq!(t.block_reason().as_deref(), Some("waiting on review"));
    }

    #[test]
    fn contextual_view_reads_relations() {
        let e = EntityRecord::new("s", "session")
            .with_capability(Capability::HasContext)
            .with_field("related_entities", json!({"tasks": ["t-1", "t-2"]}))
            .with_field("linked_files", json!(["src/main.rs"]));
        let ctx = e.as_contextual().unwrap().context();
        assert_eq!(ctx.related_entities["tasks"], vec!["t-1", "t-2"]);
        assert_eq!(ctx.linked_files, vec!["src/main.rs"]);
        assert!(ctx.recent_activity.is_empty());
    }

    #[test]
    fn rejects_entities_without_identity() {
        assert!(EntityRecord::from_json(json!({"type": "note"})).is_err());
        assert!(EntityRecord::from_json(json!({"id": "x"})).is_err());
        assert!(EntityRecord::from_json(json!([1, 2])).is_err());
    }
}
