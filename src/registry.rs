use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dw_plugin::capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
use dw_plugin::command::{CommandContext, CommandInfo};
use dw_plugin::entity::Entity;
use dw_plugin::error::PluginError;
use dw_plugin::event::{BusEvent, EventBus};
use dw_plugin::jsonrpc::RpcEvent;
use dw_plugin::plugin::{EventSink, Plugin, PluginContext, PluginEvent, capability_mismatches};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::subprocess::SubprocessPlugin;

/// Outcome of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command together with the plugin that provides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub plugin: String,
    #[serde(flatten)]
    pub info: CommandInfo,
}

#[derive(Default)]
struct RegistryState {
    /// Registration order.
    plugins: Vec<Arc<dyn Plugin>>,
    type_owners: HashMap<String, String>,
}

impl RegistryState {
    fn find(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.info().name == name).cloned()
    }
}

/// Single point through which the host reaches every plugin, in-process or
/// not, without caring which.
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    bus: Arc<dyn EventBus>,
    working_dir: PathBuf,
    bridges: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginRegistry {
    pub fn new(bus: Arc<dyn EventBus>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            bus,
            working_dir: working_dir.into(),
            bridges: Mutex::new(Vec::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, record and initialize a plugin.
    ///
    /// Rejected when its tags and accessors disagree, when the name is
    /// taken, or when one of its entity types already has a provider.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let info = plugin.info();
        if info.name.trim().is_empty() {
            return Err(RegistryError::UnnamedPlugin);
        }
        let mismatches = capability_mismatches(plugin.as_ref());
        if !mismatches.is_empty() {
            return Err(RegistryError::CapabilityMismatch {
                plugin: info.name,
                tags: mismatches.iter().map(|c| c.tag().to_string()).collect(),
            });
        }
        let caps = plugin.capabilities();
        let types: Vec<String> = match plugin.as_entity_provider() {
            Some(provider) if caps.has(Capability::EntityProvider) => {
                provider.entity_types().into_iter().map(|t| t.entity_type).collect()
            }
            _ => Vec::new(),
        };

        {
            let mut state = self.write();
            if state.find(&info.name).is_some() {
                return Err(RegistryError::DuplicatePlugin(info.name));
            }
            for ty in &types {
                if let Some(owner) = state.type_owners.get(ty) {
                    return Err(RegistryError::DuplicateEntityType { entity_type: ty.clone(), owner: owner.clone() });
                }
            }
            for ty in &types {
                state.type_owners.insert(ty.clone(), info.name.clone());
            }
            state.plugins.push(plugin.clone());
        }

        let sink = Arc::new(BusEventSink::new(info.name.clone(), self.bus.clone()));
        let ctx = PluginContext::new(info.name.clone(), self.working_dir.clone(), sink);
        if let Err(e) = plugin.initialize(ctx).await {
            self.remove(&info.name);
            return Err(e.into());
        }
        info!(plugin = %info.name, version = %info.version, capabilities = ?caps, "plugin registered");
        Ok(())
    }

    /// Register a subprocess plugin and bridge its event stream onto the bus.
    pub async fn register_subprocess(&self, plugin: Arc<SubprocessPlugin>) -> Result<(), RegistryError> {
        let events = plugin.take_events();
        if let Err(e) = self.register(plugin.clone()).await {
            let _ = plugin.shutdown().await;
            return Err(e);
        }
        if let Some(events) = events {
            let bridge = tokio::spawn(bridge_events(plugin.info().name, events, self.bus.clone()));
            self.bridges.lock().await.push(bridge);
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let mut state = self.write();
        let idx = state.plugins.iter().position(|p| p.info().name == name)?;
        state.type_owners.retain(|_, owner| owner != name);
        Some(state.plugins.remove(idx))
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.read().plugins.iter().map(|p| p.info()).collect()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.read().find(name)
    }

    pub fn capabilities(&self, name: &str) -> Option<CapabilitySet> {
        self.plugin(name).map(|p| p.capabilities())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.read().plugins.clone()
    }

    fn providers(&self) -> Vec<Arc<dyn Plugin>> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.capabilities().has(Capability::EntityProvider))
            .collect()
    }

    /// Every entity type, with the plugin that serves it.
    pub fn entity_types(&self) -> Vec<(String, EntityTypeInfo)> {
        let mut out = Vec::new();
        for plugin in self.providers() {
            if let Some(provider) = plugin.as_entity_provider() {
                let name = plugin.info().name;
                out.extend(provider.entity_types().into_iter().map(|t| (name.clone(), t)));
            }
        }
        out
    }

    /// Typed queries go to the owner of the type. Untyped ones fan out to
    /// every provider; a failing provider is logged and skipped.
    pub async fn query(&self, query: &EntityQuery) -> Result<Vec<Box<dyn Entity>>, RegistryError> {
        if !query.entity_type.is_empty() {
            let owner = self.read().type_owners.get(&query.entity_type).cloned();
            let plugin = owner
                .and_then(|name| self.plugin(&name))
                .ok_or_else(|| RegistryError::UnknownEntityType(query.entity_type.clone()))?;
            let provider = plugin
                .as_entity_provider()
                .ok_or_else(|| RegistryError::UnknownEntityType(query.entity_type.clone()))?;
            return Ok(provider.query(query).await?);
        }

        let mut out: Vec<Box<dyn Entity>> = Vec::new();
        for plugin in self.providers() {
            let Some(provider) = plugin.as_entity_provider() else { continue };
            match provider.query(query).await {
                Ok(entities) => out.extend(entities),
                Err(e) => warn!(plugin = %plugin.info().name, error = %e, "provider query failed, skipping"),
            }
        }
        if query.limit > 0 {
            out.truncate(query.limit);
        }
        Ok(out)
    }

    /// First provider that knows the id wins.
    pub async fn get_entity(&self, entity_id: &str) -> Result<Box<dyn Entity>, RegistryError> {
        for plugin in self.providers() {
            let Some(provider) = plugin.as_entity_provider() else { continue };
            match provider.get_entity(entity_id).await {
                Ok(entity) => return Ok(entity),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(plugin = %plugin.info().name, entity_id, error = %e, "get_entity failed, trying next provider"),
            }
        }
        Err(PluginError::NotFound(format!("entity {entity_id}")).into())
    }

    /// Routed to updaters in registration order. `NotFound` moves on to the
    /// next one; anything else is the answer.
    pub async fn update_entity(&self, entity_id: &str, fields: Map<String, Value>) -> Result<Box<dyn Entity>, RegistryError> {
        for plugin in self.snapshot() {
            if !plugin.capabilities().has(Capability::EntityUpdater) {
                continue;
            }
            let Some(updater) = plugin.as_entity_updater() else { continue };
            match updater.update_entity(entity_id, fields.clone()).await {
                Ok(entity) => return Ok(entity),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(PluginError::NotFound(format!("entity {entity_id}")).into())
    }

    pub fn list_commands(&self) -> Vec<PluginCommand> {
        let mut out = Vec::new();
        for plugin in self.snapshot() {
            if !plugin.capabilities().has(Capability::CommandProvider) {
                continue;
            }
            let Some(provider) = plugin.as_command_provider() else { continue };
            let name = plugin.info().name;
            out.extend(provider.commands().into_iter().map(|c| PluginCommand { plugin: name.clone(), info: c.info() }));
        }
        out
    }

    /// Run `command` of `plugin`, writing its output to `stdout`.
    ///
    /// Lookup failures are errors; a command that runs and fails is a
    /// report with a non-zero exit code.
    pub async fn execute_command(
        &self,
        plugin: &str,
        command: &str,
        args: &[String],
        stdout: Box<dyn Write + Send>,
    ) -> Result<CommandReport, RegistryError> {
        let owner = self.plugin(plugin).ok_or_else(|| RegistryError::UnknownPlugin(plugin.to_string()))?;
        if !owner.capabilities().has(Capability::CommandProvider) {
            return Err(RegistryError::NotCommandProvider(plugin.to_string()));
        }
        let provider = owner
            .as_command_provider()
            .ok_or_else(|| RegistryError::NotCommandProvider(plugin.to_string()))?;
        let cmd = provider
            .commands()
            .into_iter()
            .find(|c| c.info().name == command)
            .ok_or_else(|| RegistryError::UnknownCommand { plugin: plugin.to_string(), command: command.to_string() })?;

        let sink = Arc::new(BusEventSink::new(plugin.to_string(), self.bus.clone()));
        let mut ctx = CommandContext::new(plugin, self.working_dir.clone())
            .with_stdout(stdout)
            .with_events(sink);
        debug!(plugin, command, ?args, "executing command");
        let report = match cmd.execute(&mut ctx, args).await {
            Ok(()) => CommandReport { exit_code: 0, error: None },
            Err(e) => {
                info!(plugin, command, exit_code = e.exit_code(), "command failed: {}", e.message());
                CommandReport { exit_code: e.exit_code(), error: Some(e.message()) }
            }
        };
        let _ = ctx.stdout().flush();
        Ok(report)
    }

    /// Shut every plugin down in reverse registration order, then let the
    /// event bridges drain.
    pub async fn shutdown(&self) {
        let plugins: Vec<Arc<dyn Plugin>> = {
            let mut state = self.write();
            state.type_owners.clear();
            std::mem::take(&mut state.plugins)
        };
        for plugin in plugins.iter().rev() {
            if let Err(e) = plugin.shutdown().await {
                error!(plugin = %plugin.info().name, error = %e, "plugin shutdown failed");
            }
        }
        let bridges = std::mem::take(&mut *self.bridges.lock().await);
        for bridge in bridges {
            if tokio::time::timeout(Duration::from_secs(1), bridge).await.is_err() {
                debug!("event bridge still busy at shutdown");
            }
        }
    }
}

/// Publishes what an in-process plugin emits, stamped with its name.
pub struct BusEventSink {
    source: String,
    bus: Arc<dyn EventBus>,
}

impl BusEventSink {
    pub fn new(source: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        Self { source: source.into(), bus }
    }
}

#[async_trait]
impl EventSink for BusEventSink {
    async fn emit(&self, event: PluginEvent) -> Result<(), PluginError> {
        let mut bus_event = BusEvent::new(event.event_type, self.source.clone());
        bus_event.labels = event.labels;
        if let Some(version) = event.version {
            bus_event.metadata.insert("version".into(), Value::String(version));
        }
        bus_event.payload = serde_json::to_vec(&event.payload)?;
        self.bus
            .publish(bus_event)
            .await
            .map(|_| ())
            .map_err(|e| PluginError::Unavailable(e.to_string()))
    }
}

/// Turn a wire event into a bus event. The source is the registered
/// plugin name, not whatever the plugin put in the frame; that value is
/// kept in metadata next to the version.
pub fn bridge_event(plugin: &str, event: RpcEvent) -> BusEvent {
    let mut out = BusEvent::new(event.event_type, plugin);
    out.timestamp = DateTime::parse_from_rfc3339(&event.timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc));
    out.labels = event.metadata.unwrap_or_default();
    if let Some(version) = event.version {
        out.metadata.insert("version".into(), Value::String(version));
    }
    if !event.source.is_empty() {
        out.metadata.insert("source".into(), Value::String(event.source));
    }
    out.payload = event
        .payload
        .map(|p| serde_json::to_vec(&p).unwrap_or_default())
        .unwrap_or_default();
    out
}

async fn bridge_events(plugin: String, mut events: mpsc::UnboundedReceiver<RpcEvent>, bus: Arc<dyn EventBus>) {
    while let Some(event) = events.recv().await {
        let bus_event = bridge_event(&plugin, event);
        if let Err(e) = bus.publish(bus_event).await {
            warn!(plugin = %plugin, error = %e, "dropping plugin event");
        }
    }
    debug!(plugin = %plugin, "event bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bridged_events_keep_labels_and_provenance() {
        let mut payload = Map::new();
        payload.insert("subject".into(), json!("hi"));
        let mut wire = RpcEvent::new("gmail.email_received", "gmail-sync", payload);
        wire.metadata = Some(HashMap::from([("label".to_string(), "Inbox".to_string())]));
        wire.version = Some("2.0".into());
        wire.timestamp = "2025-01-02T03:04:05.678Z".into();

        let ev = bridge_event("gmail", wire);
        assert_eq!(ev.source, "gmail");
        assert_eq!(ev.labels["label"], "Inbox");
        assert_eq!(ev.metadata["version"], "2.0");
        assert_eq!(ev.metadata["source"], "gmail-sync");
        assert_eq!(ev.payload_json(), Some(json!({"subject": "hi"})));
        assert_eq!(ev.timestamp.map(|t| t.timestamp_subsec_millis()), Some(678));
    }

    #[test]
    fn unparseable_timestamps_are_left_to_the_bus() {
        let mut wire = RpcEvent::new("x.y", "p", Map::new());
        wire.timestamp = "yesterday".into();
        assert!(bridge_event("p", wire).timestamp.is_none());
    }
}
