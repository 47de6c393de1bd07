use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::EnumString;

use crate::entity::Entity;

/// Named behavior contracts a plugin or entity can declare.
///
/// The tag list is the only runtime type information the host has about a
/// plugin, in-process or not. Callers check a tag before any optional call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString)]
pub enum Capability {
    #[strum(serialize = "IEntityProvider", serialize = "entity_provider")]
    EntityProvider,
    #[strum(serialize = "IEntityUpdater", serialize = "entity_updater")]
    EntityUpdater,
    #[strum(serialize = "ICommandProvider", serialize = "command_provider")]
    CommandProvider,
    #[strum(serialize = "IEventEmitter", serialize = "event_emitter")]
    EventEmitter,
    #[strum(serialize = "IExtensible", serialize = "extensible")]
    Extensible,
    #[strum(serialize = "ITrackable", serialize = "trackable")]
    Trackable,
    #[strum(serialize = "IHasContext", serialize = "has_context")]
    HasContext,
}

impl Capability {
    /// Canonical wire tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Capability::EntityProvider => "IEntityProvider",
            Capability::EntityUpdater => "IEntityUpdater",
            Capability::CommandProvider => "ICommandProvider",
            Capability::EventEmitter => "IEventEmitter",
            Capability::Extensible => "IExtensible",
            Capability::Trackable => "ITrackable",
            Capability::HasContext => "IHasContext",
        }
    }

    /// Tags that describe plugins (as opposed to entities).
    pub const PLUGIN: [Capability; 4] = [
        Capability::EntityProvider,
        Capability::EntityUpdater,
        Capability::CommandProvider,
        Capability::EventEmitter,
    ];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Unordered set of capability tags.
///
/// Unknown tags are kept verbatim so a newer plugin can advertise contracts
/// this host does not know about yet. Known aliases are folded to the
/// canonical tag on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: impl AsRef<str>) {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            return;
        }
        let canonical = tag
            .parse::<Capability>()
            .map(|c| c.tag().to_string())
            .unwrap_or_else(|_| tag.to_string());
        self.0.insert(canonical);
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap.tag());
        self
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.0.contains(cap.tag())
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        match tag.parse::<Capability>() {
            Ok(cap) => self.has(cap),
            Err(_) => self.0.contains(tag),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for CapabilitySet {
    fn from(tags: Vec<String>) -> Self {
        tags.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<String> {
    fn from(set: CapabilitySet) -> Self {
        set.0.into_iter().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

/// Plugin descriptor. Immutable once reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Version")]
    pub version: String,
    #[serde(default, alias = "Description")]
    pub description: String,
    #[serde(default, alias = "IsCore")]
    pub is_core: bool,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            is_core: false,
        }
    }
}

/// Metadata about a queryable kind of entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeInfo {
    #[serde(rename = "type", alias = "Type")]
    pub entity_type: String,
    #[serde(default, alias = "DisplayName")]
    pub display_name: String,
    #[serde(default, alias = "DisplayNamePlural")]
    pub display_name_plural: String,
    #[serde(default, alias = "Capabilities")]
    pub capabilities: CapabilitySet,
    #[serde(default, alias = "Icon")]
    pub icon: String,
    #[serde(default, alias = "Description")]
    pub description: String,
}

/// Criteria for `query_entities`. A `limit` of zero means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    #[serde(default, alias = "EntityType")]
    pub entity_type: String,
    #[serde(default, alias = "Filters", skip_serializing_if = "Map::is_empty")]
    pub filters: Map<String, Value>,
    #[serde(default, alias = "Limit")]
    pub limit: usize,
    #[serde(default, alias = "Offset")]
    pub offset: usize,
    #[serde(default, alias = "SortBy", skip_serializing_if = "String::is_empty")]
    pub sort_by: String,
    #[serde(default, alias = "SortDesc")]
    pub sort_desc: bool,
}

impl EntityQuery {
    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self { entity_type: entity_type.into(), ..Default::default() }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    /// Type and field-equality filters.
    pub fn matches(&self, entity: &dyn Entity) -> bool {
        if !self.entity_type.is_empty() && entity.entity_type() != self.entity_type {
            return false;
        }
        self.filters
            .iter()
            .all(|(k, v)| entity.field(k).is_some_and(|actual| &actual == v))
    }

    /// Filter, sort and paginate an in-memory entity list.
    pub fn apply(&self, entities: Vec<Box<dyn Entity>>) -> Vec<Box<dyn Entity>> {
        let mut hits: Vec<_> = entities.into_iter().filter(|e| self.matches(e.as_ref())).collect();
        if !self.sort_by.is_empty() {
            hits.sort_by(|a, b| compare_values(a.field(&self.sort_by).as_ref(), b.field(&self.sort_by).as_ref()));
            if self.sort_desc {
                hits.reverse();
            }
        }
        self.paginate(hits)
    }

    /// Cut an already filtered and sorted result set down to `offset`/`limit`.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit > 0 {
            iter.take(self.limit).collect()
        } else {
            iter.collect()
        }
    }
}

// missing sorts first, numbers numerically, everything else by its text
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRecord;
    use serde_json::json;

    #[test]
    fn apply_filters_sorts_and_pages() {
        let all: Vec<Box<dyn Entity>> = vec![
            Box::new(EntityRecord::new("a", "task").with_field("rank", json!(3)).with_field("status", json!("todo"))),
            Box::new(EntityRecord::new("b", "task").with_field("rank", json!(1)).with_field("status", json!("todo"))),
            Box::new(EntityRecord::new("c", "task").with_field("rank", json!(2)).with_field("status", json!("done"))),
            Box::new(EntityRecord::new("n", "note").with_field("rank", json!(0))),
        ];
        let q = EntityQuery {
            entity_type: "task".into(),
            filters: json!({"status": "todo"}).as_object().cloned().unwrap(),
            sort_by: "rank".into(),
            sort_desc: true,
            ..Default::default()
        };
        let ids: Vec<String> = q.apply(all).iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn aliases_fold_to_canonical_tags() {
        let set: CapabilitySet = vec!["entity_provider".to_string(), "IEventEmitter".to_string()].into();
        assert!(set.has(Capability::EntityProvider));
        assert!(set.has(Capability::EventEmitter));
        assert!(!set.has(Capability::EntityUpdater));
        assert!(set.contains_tag("IEntityProvider"));
        assert!(set.contains_tag("event_emitter"));
        assert_eq!(serde_json::to_value(&set).unwrap(), json!(["IEntityProvider", "IEventEmitter"]));
    }

    #[test]
    fn unknown_tags_are_kept() {
        let set: CapabilitySet = ["IHookProvider"].into_iter().collect();
        assert!(set.contains_tag("IHookProvider"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn entity_type_info_accepts_both_casings() {
        let snake: EntityTypeInfo = serde_json::from_value(json!({
            "type": "note", "display_name": "Note", "display_name_plural": "Notes"
        }))
        .unwrap();
        let pascal: EntityTypeInfo = serde_json::from_value(json!({
            "Type": "note", "DisplayName": "Note", "DisplayNamePlural": "Notes", "Capabilities": []
        }))
        .unwrap();
        assert_eq!(snake, pascal);
    }

    #[test]
    fn paginate_honours_offset_and_limit() {
        let q = EntityQuery { offset: 1, limit: 2, ..Default::default() };
        assert_eq!(q.paginate(vec![1, 2, 3, 4]), vec![2, 3]);
        let unbounded = EntityQuery { offset: 3, ..Default::default() };
        assert_eq!(unbounded.paginate(vec![1, 2, 3, 4]), vec![4]);
    }
}
