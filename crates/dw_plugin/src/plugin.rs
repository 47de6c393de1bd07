use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
use crate::command::Command;
use crate::entity::Entity;
use crate::error::PluginError;
use crate::logging::PluginLogger;

/// The one trait plugin authors implement.
///
/// Optional contracts are reached through the `as_*` accessors. A plugin
/// must return `Some` from exactly the accessors whose tag it lists in
/// [`Plugin::capabilities`]; the host refuses to register it otherwise.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn capabilities(&self) -> CapabilitySet;

    /// Called once by the host before the plugin is used.
    async fn initialize(&self, _ctx: PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn as_entity_provider(&self) -> Option<&dyn EntityProvider> {
        None
    }

    fn as_entity_updater(&self) -> Option<&dyn EntityUpdater> {
        None
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        None
    }

    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        None
    }
}

/// Exposes queryable entities.
#[async_trait]
pub trait EntityProvider: Send + Sync {
    fn entity_types(&self) -> Vec<EntityTypeInfo>;

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Box<dyn Entity>>, PluginError>;

    /// `NotFound` when the id is unknown to this provider.
    async fn get_entity(&self, entity_id: &str) -> Result<Box<dyn Entity>, PluginError>;
}

/// Writes entity fields. Only meaningful on a plugin that is also an
/// [`EntityProvider`].
#[async_trait]
pub trait EntityUpdater: Send + Sync {
    /// `ReadOnly` when the entity exists but can't change, `NotFound` when
    /// the id is unknown.
    async fn update_entity(&self, entity_id: &str, fields: Map<String, Value>) -> Result<Box<dyn Entity>, PluginError>;
}

pub trait CommandProvider: Send + Sync {
    fn commands(&self) -> Vec<Arc<dyn Command>>;
}

/// Marker. Emission happens through [`PluginContext::events`] or, for a
/// subprocess, the RPC event channel.
pub trait EventEmitter: Send + Sync {}

/// Event as a plugin emits it. The host stamps source, id and time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl PluginEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), ..Default::default() }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Where plugin events go.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: PluginEvent) -> Result<(), PluginError>;
}

/// Sink that drops everything. Used when a plugin is driven outside a host.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: PluginEvent) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Handed to [`Plugin::initialize`].
#[derive(Clone)]
pub struct PluginContext {
    pub working_dir: PathBuf,
    pub config: Map<String, Value>,
    pub events: Arc<dyn EventSink>,
    pub logger: PluginLogger,
}

impl PluginContext {
    pub fn new(plugin: impl Into<String>, working_dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            working_dir: working_dir.into(),
            config: Map::new(),
            events,
            logger: PluginLogger::new(plugin),
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

/// Tags whose declaration disagrees with the accessor. Empty means the
/// plugin is consistent.
pub fn capability_mismatches(plugin: &dyn Plugin) -> Vec<Capability> {
    let declared = plugin.capabilities();
    let mut wrong = Vec::new();
    for cap in Capability::PLUGIN {
        let satisfied = match cap {
            Capability::EntityProvider => plugin.as_entity_provider().is_some(),
            Capability::EntityUpdater => plugin.as_entity_updater().is_some(),
            Capability::CommandProvider => plugin.as_command_provider().is_some(),
            Capability::EventEmitter => plugin.as_event_emitter().is_some(),
            _ => continue,
        };
        if declared.has(cap) != satisfied {
            wrong.push(cap);
        }
    }
    // updating entities nobody can read is meaningless
    if declared.has(Capability::EntityUpdater) && !declared.has(Capability::EntityProvider) && !wrong.contains(&Capability::EntityProvider) {
        wrong.push(Capability::EntityProvider);
    }
    wrong
}
