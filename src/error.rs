use std::io;
use std::path::PathBuf;
use std::time::Duration;

use dw_plugin::error::PluginError;
use dw_plugin::jsonrpc::RpcError;
use thiserror::Error;

/// Failures of the subprocess channel itself, as opposed to errors the
/// plugin reported.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("`{method}` got no response within {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("plugin process terminated")]
    ProcessTerminated,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<TransportError> for PluginError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { after, .. } => PluginError::Timeout(after.as_millis() as u64),
            TransportError::ProcessTerminated => PluginError::Unavailable("plugin process terminated".into()),
            TransportError::Rpc(rpc) => PluginError::from_rpc(rpc),
            other => PluginError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin `{0}` is already registered")]
    DuplicatePlugin(String),

    #[error("entity type `{entity_type}` is already provided by `{owner}`")]
    DuplicateEntityType { entity_type: String, owner: String },

    #[error("plugin `{plugin}` declares capabilities it does not implement (or the reverse): {tags:?}")]
    CapabilityMismatch { plugin: String, tags: Vec<String> },

    #[error("plugin reported an empty name")]
    UnnamedPlugin,

    #[error("no plugin named `{0}`")]
    UnknownPlugin(String),

    #[error("no provider for entity type `{0}`")]
    UnknownEntityType(String),

    #[error("plugin `{0}` does not provide commands")]
    NotCommandProvider(String),

    #[error("plugin `{plugin}` has no command `{command}`")]
    UnknownCommand { plugin: String, command: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Plugin(err) if err.is_not_found())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid plugin config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
}
