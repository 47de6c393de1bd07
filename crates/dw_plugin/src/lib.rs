//! Plugin SDK: the capability contracts, the JSON-RPC wire types and the
//! stdio runtime a subprocess plugin links against.

pub mod capability;
pub mod command;
pub mod entity;
pub mod error;
pub mod event;
pub mod jsonrpc;
pub mod logging;
pub mod plugin;
pub mod plugin_runtime;
pub mod repository;

#[cfg(any(test, feature = "test-utils"))]
pub mod plugin_test_util;

pub use capability::{Capability, CapabilitySet, EntityQuery, EntityTypeInfo, PluginInfo};
pub use command::{Command, CommandContext, CommandError, CommandInfo};
pub use entity::{Contextual, Entity, EntityRecord, Trackable};
pub use error::{PluginError, PluginResult};
pub use plugin::{
    CommandProvider, EntityProvider, EntityUpdater, EventEmitter, EventSink, Plugin, PluginContext, PluginEvent,
};
