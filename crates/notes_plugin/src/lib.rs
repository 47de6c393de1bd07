use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dw_plugin::capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
use dw_plugin::command::{Command, CommandContext, CommandError, CommandInfo};
use dw_plugin::entity::{ActivityRecord, Contextual, Entity, EntityContext};
use dw_plugin::error::PluginError;
use dw_plugin::plugin::{
    CommandProvider, EntityProvider, EntityUpdater, EventEmitter, Plugin, PluginContext, PluginEvent,
};
use serde_json::{Map, Value, json};
use tracing::info;

pub const NOTE_TYPE: &str = "note";

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub linked_files: Vec<String>,
    /// Locked notes refuse updates.
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    fn new(id: String, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            body: body.into(),
            tags: Vec::new(),
            linked_files: Vec::new(),
            locked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The note with `fields` applied. Any bad field rejects the whole diff.
    fn applied(&self, fields: &Map<String, Value>) -> Result<Note, PluginError> {
        let mut next = self.clone();
        for (key, value) in fields {
            match key.as_str() {
                "title" => next.title = string_field(key, value)?,
                "body" => next.body = string_field(key, value)?,
                "tags" => next.tags = string_list(key, value)?,
                "linked_files" => next.linked_files = string_list(key, value)?,
                other => return Err(PluginError::InvalidArgument(format!("unknown note field `{other}`"))),
            }
        }
        next.updated_at = Utc::now();
        Ok(next)
    }
}

fn string_field(key: &str, value: &Value) -> Result<String, PluginError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PluginError::InvalidArgument(format!("`{key}` must be a string")))
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>, PluginError> {
    let items = value
        .as_array()
        .ok_or_else(|| PluginError::InvalidArgument(format!("`{key}` must be a list")))?;
    items.iter().map(|v| string_field(key, v)).collect()
}

impl Entity for Note {
    fn id(&self) -> &str {
        &self.id
    }

    fn entity_type(&self) -> &str {
        NOTE_TYPE
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new().with(Capability::Extensible).with(Capability::HasContext)
    }

    fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".into(), json!(self.id));
        map.insert("type".into(), json!(NOTE_TYPE));
        map.insert("title".into(), json!(self.title));
        map.insert("body".into(), json!(self.body));
        map.insert("tags".into(), json!(self.tags));
        map.insert("linked_files".into(), json!(self.linked_files));
        map.insert("locked".into(), json!(self.locked));
        map.insert("created_at".into(), json!(self.created_at.to_rfc3339()));
        map.insert("updated_at".into(), json!(self.updated_at.to_rfc3339()));
        map
    }

    fn as_contextual(&self) -> Option<&dyn Contextual> {
        Some(self)
    }
}

impl Contextual for Note {
    fn context(&self) -> EntityContext {
        let mut related = HashMap::new();
        if !self.tags.is_empty() {
            related.insert("tag".to_string(), self.tags.clone());
        }
        EntityContext {
            related_entities: related,
            linked_files: self.linked_files.clone(),
            recent_activity: vec![ActivityRecord {
                timestamp: self.updated_at,
                activity_type: "updated".into(),
                description: format!("note `{}` last changed", self.title),
                actor: String::new(),
            }],
            metadata: Map::new(),
        }
    }
}

#[derive(Default)]
struct Store {
    notes: DashMap<String, Note>,
    next_id: AtomicU64,
}

impl Store {
    fn add(&self, title: &str, body: &str) -> Note {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let note = Note::new(format!("note-{n}"), title, body);
        self.notes.insert(note.id.clone(), note.clone());
        note
    }

    fn sorted(&self) -> Vec<Note> {
        let mut all: Vec<Note> = self.notes.iter().map(|n| n.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

/// Keeps notes in memory and exposes them as entities, commands and events.
pub struct NotesPlugin {
    store: Arc<Store>,
    ctx: OnceLock<PluginContext>,
}

impl Default for NotesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl NotesPlugin {
    pub fn new() -> Self {
        Self { store: Arc::new(Store::default()), ctx: OnceLock::new() }
    }

    /// Seed a note; handy for tests and demos.
    pub fn with_note(self, title: &str, body: &str) -> Self {
        self.store.add(title, body);
        self
    }

    async fn emit(&self, event: PluginEvent) {
        if let Some(ctx) = self.ctx.get() {
            if let Err(e) = ctx.events.emit(event).await {
                ctx.logger.warn("emit", &format!("event dropped: {e}"));
            }
        }
    }
}

#[async_trait]
impl Plugin for NotesPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo::new("notes", env!("CARGO_PKG_VERSION"), "Plain text notes")
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new()
            .with(Capability::EntityProvider)
            .with(Capability::EntityUpdater)
            .with(Capability::CommandProvider)
            .with(Capability::EventEmitter)
    }

    async fn initialize(&self, ctx: PluginContext) -> Result<(), PluginError> {
        info!(working_dir = %ctx.working_dir.display(), "notes plugin initialized");
        let _ = self.ctx.set(ctx);
        Ok(())
    }

    fn as_entity_provider(&self) -> Option<&dyn EntityProvider> {
        Some(self)
    }

    fn as_entity_updater(&self) -> Option<&dyn EntityUpdater> {
        Some(self)
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        Some(self)
    }

    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        Some(self)
    }
}

#[async_trait]
impl EntityProvider for NotesPlugin {
    fn entity_types(&self) -> Vec<EntityTypeInfo> {
        vec![EntityTypeInfo {
            entity_type: NOTE_TYPE.into(),
            display_name: "Note".into(),
            display_name_plural: "Notes".into(),
            capabilities: CapabilitySet::new().with(Capability::Extensible).with(Capability::HasContext),
            icon: "📝".into(),
            description: "Free-form text notes".into(),
        }]
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Box<dyn Entity>>, PluginError> {
        let all = self.store.sorted().into_iter().map(|n| Box::new(n) as Box<dyn Entity>).collect();
        Ok(query.apply(all))
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Box<dyn Entity>, PluginError> {
        self.store
            .notes
            .get(entity_id)
            .map(|n| Box::new(n.value().clone()) as Box<dyn Entity>)
            .ok_or_else(|| PluginError::NotFound(format!("note {entity_id}")))
    }
}

#[async_trait]
impl EntityUpdater for NotesPlugin {
    async fn update_entity(&self, entity_id: &str, fields: Map<String, Value>) -> Result<Box<dyn Entity>, PluginError> {
        let updated = {
            let mut note = self
                .store
                .notes
                .get_mut(entity_id)
                .ok_or_else(|| PluginError::NotFound(format!("note {entity_id}")))?;
            if note.locked {
                return Err(PluginError::ReadOnly(format!("note {entity_id} is locked")));
            }
            let next = note.applied(&fields)?;
            *note = next.clone();
            next
        };
        let changed: Vec<&String> = fields.keys().collect();
        self.emit(
            PluginEvent::new("note.updated")
                .with_payload("note_id", json!(entity_id))
                .with_payload("fields", json!(changed))
                .with_label("entity_type", NOTE_TYPE),
        )
        .await;
        Ok(Box::new(updated))
    }
}

impl CommandProvider for NotesPlugin {
    fn commands(&self) -> Vec<Arc<dyn Command>> {
        vec![
            Arc::new(AddNote { store: self.store.clone() }),
            Arc::new(ListNotes { store: self.store.clone() }),
            Arc::new(LockNote { store: self.store.clone() }),
        ]
    }
}

impl EventEmitter for NotesPlugin {}

fn write_out(ctx: &mut CommandContext, text: &str) -> Result<(), CommandError> {
    writeln!(ctx.stdout(), "{text}").map_err(|e| PluginError::Internal(e.to_string()))?;
    Ok(())
}

struct AddNote {
    store: Arc<Store>,
}

#[async_trait]
impl Command for AddNote {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "add".into(),
            description: "Create a note".into(),
            usage: "add <title> [body...]".into(),
            help: "The first argument is the title, the rest is joined into the body.".into(),
        }
    }

    async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError> {
        let Some((title, body)) = args.split_first() else {
            return Err(CommandError::failed(2, "usage: add <title> [body...]"));
        };
        let note = self.store.add(title, &body.join(" "));
        write_out(ctx, &note.id)?;
        ctx.emit(
            PluginEvent::new("note.created")
                .with_payload("note_id", json!(note.id))
                .with_payload("title", json!(note.title))
                .with_label("entity_type", NOTE_TYPE),
        )
        .await?;
        Ok(())
    }
}

struct ListNotes {
    store: Arc<Store>,
}

#[async_trait]
impl Command for ListNotes {
    fn info(&self) -> CommandInfo {
        CommandInfo { name: "list".into(), description: "List notes".into(), usage: "list".into(), ..Default::default() }
    }

    async fn execute(&self, ctx: &mut CommandContext, _args: &[String]) -> Result<(), CommandError> {
        for note in self.store.sorted() {
            let lock = if note.locked { " [locked]" } else { "" };
            write_out(ctx, &format!("{}  {}{}", note.id, note.title, lock))?;
        }
        Ok(())
    }
}

struct LockNote {
    store: Arc<Store>,
}

#[async_trait]
impl Command for LockNote {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "lock".into(),
            description: "Make a note read-only".into(),
            usage: "lock <id>".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError> {
        let [id] = args else {
            return Err(CommandError::failed(2, "usage: lock <id>"));
        };
        match self.store.notes.get_mut(id) {
            Some(mut note) => note.locked = true,
            None => return Err(CommandError::failed(1, format!("no note {id}"))),
        }
        write_out(ctx, &format!("locked {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_plugin::command::SharedBuffer;
    use dw_plugin::plugin::capability_mismatches;

    #[test]
    fn declares_exactly_what_it_implements() {
        assert!(capability_mismatches(&NotesPlugin::new()).is_empty());
    }

    #[tokio::test]
    async fn locked_notes_are_read_only() {
        let plugin = NotesPlugin::new().with_note("first", "body");
        let out = SharedBuffer::new();
        let mut ctx = CommandContext::new("notes", ".").with_stdout(out.clone());
        let lock = plugin.commands().into_iter().find(|c| c.info().name == "lock").unwrap();
        lock.execute(&mut ctx, &["note-1".to_string()]).await.unwrap();
        assert_eq!(out.contents(), "locked note-1\n");

        let mut fields = Map::new();
        fields.insert("title".into(), json!("changed"));
        let err = plugin.update_entity("note-1", fields).await.unwrap_err();
        assert!(matches!(err, PluginError::ReadOnly(_)));
        assert!(plugin.update_entity("note-9", Map::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejected_diff_leaves_the_note_untouched() {
        let plugin = NotesPlugin::new().with_note("first", "body");
        let mut fields = Map::new();
        fields.insert("body".into(), json!("rewritten"));
        fields.insert("zzz".into(), json!(1));
        let err = plugin.update_entity("note-1", fields).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidArgument(_)));
        let note = plugin.get_entity("note-1").await.unwrap();
        assert_eq!(note.field("body"), Some(json!("body")));
    }

    #[tokio::test]
    async fn add_then_query_by_field() {
        let plugin = NotesPlugin::new();
        let mut ctx = CommandContext::new("notes", ".");
        let add = plugin.commands().into_iter().find(|c| c.info().name == "add").unwrap();
        add.execute(&mut ctx, &["groceries".into(), "milk".into(), "eggs".into()]).await.unwrap();
        add.execute(&mut ctx, &["todo".into()]).await.unwrap();
        assert_eq!(add.execute(&mut ctx, &[]).await.unwrap_err().exit_code(), 2);

        let hits = plugin
            .query(&EntityQuery::of_type(NOTE_TYPE).with_filter("title", json!("groceries")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field("body"), Some(json!("milk eggs")));
        assert!(hits[0].as_contextual().is_some());
    }
}
