use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};

use crate::capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
use crate::command::{Command, CommandContext, CommandError, CommandInfo};
use crate::entity::{Entity, EntityRecord};
use crate::error::PluginError;
use crate::plugin::{
    CommandProvider, EntityProvider, EntityUpdater, EventEmitter, Plugin, PluginContext, PluginEvent,
};

/// Configurable in-process plugin for tests.
///
/// Serves one entity type from an in-memory map. Contracts are switched on
/// with the builder methods and the declared tags follow them, so the
/// plugin always passes registration unless [`MockPlugin::lying`] is set.
pub struct MockPlugin {
    info: PluginInfo,
    entity_type: String,
    entities: DashMap<String, EntityRecord>,
    read_only: DashSet<String>,
    updatable: bool,
    commands: bool,
    emitter: bool,
    failing_queries: bool,
    lying: bool,
    ctx: OnceLock<PluginContext>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl MockPlugin {
    pub fn new(name: &str, entity_type: &str) -> Self {
        Self {
            info: PluginInfo::new(name, "0.0.1", format!("mock {entity_type} provider")),
            entity_type: entity_type.to_string(),
            entities: DashMap::new(),
            read_only: DashSet::new(),
            updatable: false,
            commands: false,
            emitter: false,
            failing_queries: false,
            lying: false,
            ctx: OnceLock::new(),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_entity(self, entity: EntityRecord) -> Self {
        self.entities.insert(entity.id().to_string(), entity);
        self
    }

    pub fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    /// Adds `echo` (writes its args) and `fail` (exits 3).
    pub fn with_commands(mut self) -> Self {
        self.commands = true;
        self
    }

    pub fn emitter(mut self) -> Self {
        self.emitter = true;
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.failing_queries = true;
        self
    }

    pub fn read_only(self, entity_id: &str) -> Self {
        self.read_only.insert(entity_id.to_string());
        self
    }

    /// Declare the command contract without implementing it.
    pub fn lying(mut self) -> Self {
        self.lying = true;
        self
    }

    pub fn was_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Emit through the context handed to `initialize`.
    pub async fn emit(&self, event: PluginEvent) -> Result<(), PluginError> {
        match self.ctx.get() {
            Some(ctx) => ctx.events.emit(event).await,
            None => Err(PluginError::Unavailable(format!("{} is not initialized", self.info.name))),
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::new().with(Capability::EntityProvider);
        if self.updatable {
            caps.insert(Capability::EntityUpdater.tag());
        }
        if self.commands || self.lying {
            caps.insert(Capability::CommandProvider.tag());
        }
        if self.emitter {
            caps.insert(Capability::EventEmitter.tag());
        }
        caps
    }

    async fn initialize(&self, ctx: PluginContext) -> Result<(), PluginError> {
        let _ = self.ctx.set(ctx);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_entity_provider(&self) -> Option<&dyn EntityProvider> {
        Some(self)
    }

    fn as_entity_updater(&self) -> Option<&dyn EntityUpdater> {
        self.updatable.then_some(self as &dyn EntityUpdater)
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        self.commands.then_some(self as &dyn CommandProvider)
    }

    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        self.emitter.then_some(self as &dyn EventEmitter)
    }
}

#[async_trait]
impl EntityProvider for MockPlugin {
    fn entity_types(&self) -> Vec<EntityTypeInfo> {
        vec![EntityTypeInfo {
            entity_type: self.entity_type.clone(),
            display_name: self.entity_type.clone(),
            display_name_plural: format!("{}s", self.entity_type),
            capabilities: CapabilitySet::new().with(Capability::Extensible),
            ..Default::default()
        }]
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Box<dyn Entity>>, PluginError> {
        if self.failing_queries {
            return Err(PluginError::Internal(format!("{} query failed", self.info.name)));
        }
        let mut all: Vec<EntityRecord> = self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(query.apply(all.into_iter().map(|e| Box::new(e) as Box<dyn Entity>).collect()))
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Box<dyn Entity>, PluginError> {
        self.entities
            .get(entity_id)
            .map(|e| Box::new(e.value().clone()) as Box<dyn Entity>)
            .ok_or_else(|| PluginError::NotFound(format!("{} {entity_id}", self.entity_type)))
    }
}

#[async_trait]
impl EntityUpdater for MockPlugin {
    async fn update_entity(&self, entity_id: &str, fields: Map<String, Value>) -> Result<Box<dyn Entity>, PluginError> {
        if self.read_only.contains(entity_id) {
            return Err(PluginError::ReadOnly(entity_id.to_string()));
        }
        let updated = {
            let mut entry = self
                .entities
                .get_mut(entity_id)
                .ok_or_else(|| PluginError::NotFound(format!("{} {entity_id}", self.entity_type)))?;
            for (k, v) in fields {
                entry.set_field(k, v);
            }
            entry.clone()
        };
        if self.emitter {
            self.emit(PluginEvent::new(format!("{}.updated", self.entity_type)).with_payload("id", Value::from(entity_id)))
                .await?;
        }
        Ok(Box::new(updated))
    }
}

impl CommandProvider for MockPlugin {
    fn commands(&self) -> Vec<Arc<dyn Command>> {
        vec![Arc::new(EchoCommand), Arc::new(FailCommand)]
    }
}

impl EventEmitter for MockPlugin {}

struct EchoCommand;

#[async_trait]
impl Command for EchoCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo {
            name: "echo".into(),
            description: "Print the arguments".into(),
            usage: "echo [args...]".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError> {
        writeln!(ctx.stdout(), "{}", args.join(" ")).map_err(|e| PluginError::Internal(e.to_string()))?;
        Ok(())
    }
}

struct FailCommand;

#[async_trait]
impl Command for FailCommand {
    fn info(&self) -> CommandInfo {
        CommandInfo { name: "fail".into(), description: "Always exits 3".into(), ..Default::default() }
    }

    async fn execute(&self, _ctx: &mut CommandContext, _args: &[String]) -> Result<(), CommandError> {
        Err(CommandError::failed(3, "failed on purpose"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::capability_mismatches;
    use serde_json::json;

    fn notes() -> MockPlugin {
        MockPlugin::new("notes", "note")
            .with_entity(EntityRecord::new("n-1", "note").with_field("title", json!("first")))
            .with_entity(EntityRecord::new("n-2", "note").with_field("title", json!("second")))
    }

    #[test]
    fn declared_tags_follow_the_builder() {
        assert!(capability_mismatches(&notes().updatable().with_commands().emitter()).is_empty());
        assert_eq!(capability_mismatches(&notes().lying()), vec![Capability::CommandProvider]);
    }

    #[tokio::test]
    async fn read_only_entities_refuse_updates() {
        let plugin = notes().updatable().read_only("n-2");
        let updater = plugin.as_entity_updater().unwrap();
        let updated = updater.update_entity("n-1", json!({"title": "changed"}).as_object().cloned().unwrap()).await.unwrap();
        assert_eq!(updated.field("title"), Some(json!("changed")));
        let err = updater.update_entity("n-2", Map::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::ReadOnly(_)));
        let err = updater.update_entity("missing", Map::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
