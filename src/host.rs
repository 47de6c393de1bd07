use std::sync::Arc;

use anyhow::{Context, Result};
use dw_plugin::event::{EventBus, EventFilter};
use dw_plugin::plugin::Plugin;
use dw_plugin::repository::EventRepository;
use tracing::{error, info};

use crate::bus::InMemoryEventBus;
use crate::config::HostConfig;
use crate::error::RegistryError;
use crate::event_log::{EventLog, JsonlEventLog};
use crate::registry::PluginRegistry;
use crate::repository::{EventRecorder, MemoryEventRepository};
use crate::subprocess::SubprocessPlugin;

/// The wired runtime: bus, event recording and the plugin registry.
pub struct Host {
    config: HostConfig,
    bus: Arc<InMemoryEventBus>,
    registry: Arc<PluginRegistry>,
    repository: Arc<MemoryEventRepository>,
}

impl Host {
    /// Build the bus (with its log when configured), start recording, then
    /// launch every configured subprocess plugin. A plugin that fails to
    /// start or register is logged and left out.
    pub async fn start(config: HostConfig) -> Result<Self> {
        let mut bus = InMemoryEventBus::new();
        if let Some(path) = &config.event_log {
            let log = JsonlEventLog::open(path)
                .await
                .with_context(|| format!("opening event log {}", path.display()))?;
            bus = bus.with_log(Arc::new(log) as Arc<dyn EventLog>);
        }
        let bus = Arc::new(bus);

        let repository = Arc::new(MemoryEventRepository::with_retention(config.event_retention));
        bus.subscribe(
            EventFilter::new(),
            Arc::new(EventRecorder::new(repository.clone() as Arc<dyn EventRepository>)),
        )
        .await?;

        let registry = Arc::new(PluginRegistry::new(bus.clone() as Arc<dyn EventBus>, config.root.clone()));
        for plugin_config in &config.plugins {
            let name = plugin_config.name.clone();
            match SubprocessPlugin::spawn(plugin_config.clone()).await {
                Ok(plugin) => {
                    if let Err(e) = registry.register_subprocess(plugin).await {
                        error!(plugin = %name, error = %e, "plugin rejected");
                    }
                }
                Err(e) => error!(plugin = %name, error = %e, "plugin failed to start"),
            }
        }
        info!(root = %config.root.display(), plugins = registry.plugins().len(), "host started");

        Ok(Self { config, bus, registry, repository })
    }

    /// Add a built-in plugin.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        self.registry.register(plugin).await
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<InMemoryEventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<MemoryEventRepository> {
        &self.repository
    }

    /// Plugins first so their last events still reach the bus.
    pub async fn shutdown(&self) {
        info!("host shutting down");
        self.registry.shutdown().await;
        self.bus.shutdown().await;
    }
}
