//! Host side of the darwinflow plugin runtime.
//!
//! Plugins either live in this process or run as subprocesses speaking
//! newline-delimited JSON-RPC; [`registry::PluginRegistry`] reaches both
//! through the same capability contracts from `dw_plugin`, and
//! [`bus::InMemoryEventBus`] carries their events.

pub mod bus;
pub mod config;
pub mod error;
pub mod event_log;
pub mod host;
pub mod logger;
pub mod registry;
pub mod repository;
pub mod subprocess;
pub mod transport;

pub use dw_plugin;
