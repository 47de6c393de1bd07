use clap::Parser;
use darwinflow::{config::HostConfig, host::Host, logger::init_tracing};
use std::process;
use tracing::{error, info};

mod cli;

use cli::Cli;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = HostConfig::resolve_root(cli.root.clone());
    let mut config = HostConfig::load(&root)?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    let telemetry = init_tracing(&config.log_dir(), "dw.log", &config.log_level, config.otel_endpoint.as_deref())?;
    info!(root = %root.display(), "dw starting");

    let host = Host::start(config).await?;
    let code = match cli::execute(&host, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            1
        }
    };
    host.shutdown().await;
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    process::exit(code);
}
