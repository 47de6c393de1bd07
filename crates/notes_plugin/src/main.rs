use std::path::PathBuf;
use std::sync::Arc;

use dw_plugin::logging::{LogLevel, init_plugin_logging};
use dw_plugin::plugin_runtime::run;
use notes_plugin::NotesPlugin;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs go to a file
    let log_dir = std::env::var_os("NOTES_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"));
    let level = std::env::var("NOTES_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_plugin_logging(&log_dir, "notes_plugin.log", level)?;

    run(Arc::new(NotesPlugin::new())).await
}
