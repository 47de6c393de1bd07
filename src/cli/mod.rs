use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;
pub mod entities;
pub mod plugins;
pub mod watch;

use commands::ExecArgs;
use entities::{GetArgs, QueryArgs, UpdateArgs};
use watch::WatchArgs;

use darwinflow::host::Host;

#[derive(Parser, Debug)]
#[command(name = "dw", about = "darwinflow workflow CLI", version)]
pub struct Cli {
    /// Root directory (defaults to $DW_ROOT, then ./.darwinflow)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List loaded plugins and their capabilities
    Plugins,

    /// List entity types and the plugins serving them
    Types,

    /// Query entities
    Query(QueryArgs),

    /// Show one entity
    Get(GetArgs),

    /// Update fields of an entity
    Update(UpdateArgs),

    /// List plugin commands
    Commands,

    /// Run a plugin command
    Exec(ExecArgs),

    /// Print bus events as they arrive
    Watch(WatchArgs),
}

/// Runs a subcommand against a started host. Returns the process exit code.
pub async fn execute(host: &Host, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Plugins => plugins::list(host),
        Commands::Types => plugins::types(host),
        Commands::Query(args) => entities::query(host, args).await,
        Commands::Get(args) => entities::get(host, args).await,
        Commands::Update(args) => entities::update(host, args).await,
        Commands::Commands => commands::list(host),
        Commands::Exec(args) => commands::exec(host, args).await,
        Commands::Watch(args) => watch::execute(host, args).await,
    }
}

/// `key=value`, with the value parsed as JSON when it is JSON.
pub fn parse_assignment(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("empty key in `{raw}`");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignments_parse_json_values() {
        assert_eq!(parse_assignment("done=true").unwrap(), ("done".into(), json!(true)));
        assert_eq!(parse_assignment("title=hello world").unwrap(), ("title".into(), json!("hello world")));
        assert_eq!(parse_assignment("n=3").unwrap(), ("n".into(), json!(3)));
        assert!(parse_assignment("nokey").is_err());
    }
}
