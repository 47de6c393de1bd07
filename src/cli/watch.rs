use anyhow::bail;
use clap::Args;
use dw_plugin::event::{BusEvent, EventBus, EventFilter, handler_fn};
use serde_json::json;

use super::parse_assignment;
use darwinflow::bus::ReplayStart;
use darwinflow::host::Host;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Event type glob, e.g. `note.*`
    #[arg(long)]
    pub pattern: Option<String>,

    /// Required label, repeatable
    #[arg(long = "label", value_name = "KEY=VALUE")]
    pub labels: Vec<String>,

    #[arg(long)]
    pub source: Option<String>,

    /// Print logged events first (needs DW_EVENT_LOG)
    #[arg(long)]
    pub replay: bool,
}

fn render(event: &BusEvent) -> String {
    json!({
        "id": event.id,
        "type": event.event_type,
        "source": event.source,
        "timestamp": event.timestamp,
        "labels": event.labels,
        "payload": event.payload_json(),
    })
    .to_string()
}

pub async fn execute(host: &Host, args: WatchArgs) -> anyhow::Result<i32> {
    let mut filter = EventFilter::new();
    if let Some(pattern) = args.pattern {
        filter = filter.type_pattern(pattern);
    }
    if let Some(source) = args.source {
        filter = filter.source(source);
    }
    for raw in &args.labels {
        let (key, value) = parse_assignment(raw)?;
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        filter = filter.label(key, value);
    }

    let handler = handler_fn(|event: BusEvent| async move {
        println!("{}", render(&event));
        Ok(())
    });
    let bus = host.bus();
    let id = if args.replay {
        if host.config().event_log.is_none() {
            bail!("--replay needs an event log; set DW_EVENT_LOG");
        }
        bus.subscribe_with_replay(filter, handler, ReplayStart::Beginning).await?
    } else {
        bus.subscribe(filter, handler).await?
    };

    eprintln!("Watching events; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    bus.unsubscribe(&id).await;
    Ok(0)
}
