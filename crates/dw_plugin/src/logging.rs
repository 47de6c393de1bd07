use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::{dispatcher, level_filters::LevelFilter, Dispatch};
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::{fmt, Layer, Registry};

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

/// Logger handed to plugins and commands. Every line is a tracing event
/// tagged with the plugin name, so host and plugin logs end up in the same
/// subscriber when the plugin runs in-process.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
}

impl PluginLogger {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self { plugin: plugin.into() }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        let plugin = self.plugin.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(%plugin, %context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%plugin, %context, "{msg}"),
            LogLevel::Info => tracing::info!(%plugin, %context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%plugin, %context, "{msg}"),
            LogLevel::Error => tracing::error!(%plugin, %context, "{msg}"),
            LogLevel::Critical => tracing::error!(%plugin, %context, "[CRITICAL] {msg}"),
        }
    }

    pub fn debug(&self, context: &str, msg: &str) {
        self.log(LogLevel::Debug, context, msg)
    }

    pub fn info(&self, context: &str, msg: &str) {
        self.log(LogLevel::Info, context, msg)
    }

    pub fn warn(&self, context: &str, msg: &str) {
        self.log(LogLevel::Warn, context, msg)
    }

    pub fn error(&self, context: &str, msg: &str) {
        self.log(LogLevel::Error, context, msg)
    }
}

/// Install a daily rolling file subscriber for a subprocess plugin.
///
/// stdout carries the protocol, so a subprocess must never log there.
/// Only the first call has an effect.
pub fn init_plugin_logging(log_dir: &Path, file_name: &str, level: LogLevel) -> anyhow::Result<()> {
    static LOG_INIT: Once = Once::new();
    let mut result = Ok(());
    LOG_INIT.call_once(|| {
        if let Err(err) = std::fs::create_dir_all(log_dir) {
            result = Err(anyhow::anyhow!("cannot create log dir {}: {err}", log_dir.display()));
            return;
        }
        let file_app = daily(log_dir, file_name);
        let dispatch = Dispatch::new(
            Registry::default().with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(file_app)
                    .with_filter(LevelFilter::from(level)),
            ),
        );
        if let Err(err) = dispatcher::set_global_default(dispatch) {
            result = Err(anyhow::anyhow!("failed to install tracing subscriber: {err}"));
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Critical > LogLevel::Error);
    }

    #[test]
    fn critical_maps_to_error_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Critical), LevelFilter::ERROR);
    }
}
