use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dw_plugin::capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
use dw_plugin::command::{Command, CommandContext, CommandError, CommandInfo};
use dw_plugin::entity::{Entity, EntityRecord};
use dw_plugin::error::PluginError;
use dw_plugin::jsonrpc::{
    ExecuteCommandParams, ExecuteCommandResult, GetEntityParams, InitParams, Method, RpcEvent, UpdateEntityParams,
    codes,
};
use dw_plugin::plugin::{CommandProvider, EntityProvider, EntityUpdater, EventEmitter, Plugin, PluginContext};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::SubprocessConfig;
use crate::error::TransportError;
use crate::transport::RpcClient;

pub const MAX_RESTARTS: u32 = 3;
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// What a plugin told us about itself during the handshake.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub info: PluginInfo,
    pub capabilities: CapabilitySet,
    pub entity_types: Vec<EntityTypeInfo>,
    pub commands: Vec<CommandInfo>,
}

/// `init`, then the introspection calls gated on the reported tags.
pub async fn handshake(client: &RpcClient, working_dir: &Path, config: &Map<String, Value>) -> Result<Handshake, TransportError> {
    let init = InitParams { working_dir: working_dir.display().to_string(), config: config.clone() };
    match client.request::<_, Value>(Method::Init, Some(&init)).await {
        Ok(_) => {}
        Err(TransportError::Rpc(e)) if e.code == codes::METHOD_NOT_FOUND => {
            warn!(plugin = %client.name(), "plugin does not implement init");
        }
        Err(e) => return Err(e),
    }

    let info: PluginInfo = client.request::<(), _>(Method::GetInfo, None).await?;
    let tags: Vec<String> = client.request::<(), _>(Method::GetCapabilities, None).await?;
    let capabilities = CapabilitySet::from(tags);

    let entity_types = if capabilities.has(Capability::EntityProvider) {
        client.request::<(), _>(Method::GetEntityTypes, None).await?
    } else {
        Vec::new()
    };
    let commands = if capabilities.has(Capability::CommandProvider) {
        client.request::<(), _>(Method::GetCommands, None).await?
    } else {
        Vec::new()
    };

    Ok(Handshake { info, capabilities, entity_types, commands })
}

/// Current client. Replaced when a crashed plugin is restarted.
struct ClientSlot(RwLock<Arc<RpcClient>>);

impl ClientSlot {
    fn current(&self) -> Arc<RpcClient> {
        match self.0.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, client: Arc<RpcClient>) {
        match self.0.write() {
            Ok(mut slot) => *slot = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
    }
}

/// A plugin living in another process, driven over JSON-RPC.
///
/// Descriptor, tags, entity types and commands are read once during the
/// handshake and served from cache; the optional contracts are exposed
/// exactly when the matching tag was reported.
pub struct SubprocessPlugin {
    handshake: Handshake,
    client: Arc<ClientSlot>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RpcEvent>>>,
    stopping: Arc<AtomicBool>,
}

impl SubprocessPlugin {
    /// Run the handshake over an already connected client.
    pub async fn connect(
        client: RpcClient,
        events: mpsc::UnboundedReceiver<RpcEvent>,
        working_dir: &Path,
        config: &Map<String, Value>,
    ) -> Result<Self, TransportError> {
        let handshake = handshake(&client, working_dir, config).await?;
        info!(
            plugin = %handshake.info.name,
            version = %handshake.info.version,
            capabilities = ?handshake.capabilities,
            "subprocess plugin connected"
        );
        Ok(Self {
            handshake,
            client: Arc::new(ClientSlot(RwLock::new(Arc::new(client)))),
            events: Mutex::new(Some(events)),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Launch the configured executable and connect to it. With
    /// `restart_on_crash` a supervisor relaunches it when it dies.
    pub async fn spawn(config: SubprocessConfig) -> Result<Arc<Self>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = RpcClient::spawn(&config, tx.clone())?;
        let plugin = Arc::new(Self::connect(client, rx, &config.working_dir, &config.config).await?);
        if config.restart_on_crash {
            let supervisor = Supervisor {
                slot: plugin.client.clone(),
                stopping: plugin.stopping.clone(),
                emitter: plugin.handshake.capabilities.has(Capability::EventEmitter),
                config,
                events: tx,
            };
            tokio::spawn(supervisor.run());
        }
        Ok(plugin)
    }

    /// The plugin's event stream. Handed out once, to the bridge.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RpcEvent>> {
        match self.events.lock() {
            Ok(mut events) => events.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.client.current().is_alive()
    }

    pub fn client(&self) -> Arc<RpcClient> {
        self.client.current()
    }

    fn has(&self, cap: Capability) -> bool {
        self.handshake.capabilities.has(cap)
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: Method, params: Option<Value>) -> Result<T, PluginError> {
        let value = self.client.current().call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Plugin for SubprocessPlugin {
    fn info(&self) -> PluginInfo {
        self.handshake.info.clone()
    }

    fn capabilities(&self) -> CapabilitySet {
        self.handshake.capabilities.clone()
    }

    /// The process was initialized during the handshake; here we only open
    /// the event stream.
    async fn initialize(&self, _ctx: PluginContext) -> Result<(), PluginError> {
        if self.has(Capability::EventEmitter) {
            self.call::<Value>(Method::StartEventStream, None).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.stopping.store(true, Ordering::SeqCst);
        let client = self.client.current();
        if self.has(Capability::EventEmitter) && client.is_alive() {
            if let Err(e) = client.call(Method::StopEventStream, None).await {
                warn!(plugin = %self.handshake.info.name, error = %e, "stop_event_stream failed");
            }
        }
        client.stop().await;
        Ok(())
    }

    fn as_entity_provider(&self) -> Option<&dyn EntityProvider> {
        self.has(Capability::EntityProvider).then_some(self as &dyn EntityProvider)
    }

    fn as_entity_updater(&self) -> Option<&dyn EntityUpdater> {
        self.has(Capability::EntityUpdater).then_some(self as &dyn EntityUpdater)
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        self.has(Capability::CommandProvider).then_some(self as &dyn CommandProvider)
    }

    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        self.has(Capability::EventEmitter).then_some(self as &dyn EventEmitter)
    }
}

fn decode_entity(value: Value) -> Result<Box<dyn Entity>, PluginError> {
    Ok(Box::new(EntityRecord::from_json(value)?))
}

#[async_trait]
impl EntityProvider for SubprocessPlugin {
    fn entity_types(&self) -> Vec<EntityTypeInfo> {
        self.handshake.entity_types.clone()
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<Box<dyn Entity>>, PluginError> {
        let raw: Vec<Value> = self.call(Method::QueryEntities, Some(serde_json::to_value(query)?)).await?;
        raw.into_iter().map(decode_entity).collect()
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Box<dyn Entity>, PluginError> {
        let params = GetEntityParams { entity_id: entity_id.to_string() };
        decode_entity(self.call(Method::GetEntity, Some(serde_json::to_value(params)?)).await?)
    }
}

#[async_trait]
impl EntityUpdater for SubprocessPlugin {
    async fn update_entity(&self, entity_id: &str, fields: Map<String, Value>) -> Result<Box<dyn Entity>, PluginError> {
        let params = UpdateEntityParams { entity_id: entity_id.to_string(), fields };
        decode_entity(self.call(Method::UpdateEntity, Some(serde_json::to_value(params)?)).await?)
    }
}

impl CommandProvider for SubprocessPlugin {
    fn commands(&self) -> Vec<Arc<dyn Command>> {
        self.handshake
            .commands
            .iter()
            .map(|info| {
                Arc::new(SubprocessCommand { info: info.clone(), client: self.client.clone() }) as Arc<dyn Command>
            })
            .collect()
    }
}

impl EventEmitter for SubprocessPlugin {}

/// Runs a command inside the plugin process and relays its output.
struct SubprocessCommand {
    info: CommandInfo,
    client: Arc<ClientSlot>,
}

#[async_trait]
impl Command for SubprocessCommand {
    fn info(&self) -> CommandInfo {
        self.info.clone()
    }

    async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError> {
        let params = ExecuteCommandParams { command_name: self.info.name.clone(), args: args.to_vec() };
        let result: ExecuteCommandResult = self
            .client
            .current()
            .request(Method::ExecuteCommand, Some(&params))
            .await
            .map_err(PluginError::from)?;
        if !result.output.is_empty() {
            ctx.stdout()
                .write_all(result.output.as_bytes())
                .map_err(|e| PluginError::Internal(e.to_string()))?;
        }
        if result.exit_code != 0 {
            return Err(CommandError::failed(result.exit_code, result.error));
        }
        Ok(())
    }
}

/// Relaunches a crashed plugin a bounded number of times.
struct Supervisor {
    slot: Arc<ClientSlot>,
    stopping: Arc<AtomicBool>,
    emitter: bool,
    config: SubprocessConfig,
    events: mpsc::UnboundedSender<RpcEvent>,
}

impl Supervisor {
    async fn run(self) {
        let mut attempts = 0;
        loop {
            self.slot.current().wait_terminated().await;
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            attempts += 1;
            if attempts > MAX_RESTARTS {
                error!(plugin = %self.config.name, "plugin keeps crashing, giving up after {MAX_RESTARTS} restarts");
                return;
            }
            warn!(plugin = %self.config.name, attempt = attempts, "plugin terminated, restarting");
            tokio::time::sleep(RESTART_BACKOFF * attempts).await;
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            match self.relaunch().await {
                Ok(client) => {
                    self.slot.replace(Arc::new(client));
                    info!(plugin = %self.config.name, "plugin restarted");
                }
                Err(e) => error!(plugin = %self.config.name, error = %e, "restart failed"),
            }
        }
    }

    async fn relaunch(&self) -> Result<RpcClient, TransportError> {
        let client = RpcClient::spawn(&self.config, self.events.clone())?;
        handshake(&client, &self.config.working_dir, &self.config.config).await?;
        if self.emitter {
            client.call(Method::StartEventStream, None).await?;
        }
        Ok(client)
    }
}
