//! A plugin served by the SDK runtime on one end of a pipe, driven by the
//! host registry on the other.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use darwinflow::bus::InMemoryEventBus;
use darwinflow::error::RegistryError;
use darwinflow::registry::PluginRegistry;
use darwinflow::subprocess::SubprocessPlugin;
use darwinflow::transport::{ClientOptions, RpcClient};
use dw_plugin::capability::{Capability, EntityQuery};
use dw_plugin::command::SharedBuffer;
use dw_plugin::entity::EntityRecord;
use dw_plugin::error::PluginError;
use dw_plugin::event::{BusEvent, EventBus, EventFilter, handler_fn};
use dw_plugin::plugin::Plugin;
use dw_plugin::plugin_runtime::serve;
use dw_plugin::plugin_test_util::MockPlugin;
use serde_json::{Map, json};
use tokio::io::duplex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn tasks() -> MockPlugin {
    MockPlugin::new("tasks", "task")
        .with_entity(EntityRecord::new("t-1", "task").with_field("status", json!("open")))
        .with_entity(EntityRecord::new("t-2", "task").with_field("status", json!("done")))
        .with_entity(EntityRecord::new("t-3", "task").with_field("status", json!("open")))
        .read_only("t-3")
        .updatable()
        .with_commands()
        .emitter()
}

/// Serve `plugin` in a background task and connect a subprocess proxy to it.
async fn connect(plugin: MockPlugin) -> (Arc<SubprocessPlugin>, JoinHandle<anyhow::Result<()>>) {
    let (host_to_plugin, plugin_stdin) = duplex(64 * 1024);
    let (plugin_stdout, host_from_plugin) = duplex(64 * 1024);
    let server = tokio::spawn(serve(Arc::new(plugin), plugin_stdin, plugin_stdout));

    let (tx, rx) = mpsc::unbounded_channel();
    let options = ClientOptions { timeout: Duration::from_secs(5), max_in_flight: 4 };
    let client = RpcClient::new("tasks", host_from_plugin, host_to_plugin, options, tx);
    let proxy = SubprocessPlugin::connect(client, rx, Path::new("/tmp"), &Map::new())
        .await
        .unwrap();
    (Arc::new(proxy), server)
}

#[tokio::test]
async fn handshake_mirrors_the_plugin() {
    let (proxy, _server) = connect(tasks()).await;
    assert_eq!(proxy.info().name, "tasks");
    let caps = proxy.capabilities();
    for cap in Capability::PLUGIN {
        assert!(caps.has(cap), "missing {cap}");
    }
    assert_eq!(proxy.as_entity_provider().unwrap().entity_types()[0].entity_type, "task");
    let names: Vec<String> = proxy
        .as_command_provider()
        .unwrap()
        .commands()
        .iter()
        .map(|c| c.info().name)
        .collect();
    assert_eq!(names, vec!["echo", "fail"]);
}

#[tokio::test]
async fn plain_provider_hides_optional_contracts() {
    let (proxy, _server) = connect(MockPlugin::new("docs", "doc")).await;
    assert!(proxy.as_entity_provider().is_some());
    assert!(proxy.as_entity_updater().is_none());
    assert!(proxy.as_command_provider().is_none());
    assert!(proxy.as_event_emitter().is_none());
}

#[tokio::test]
async fn entities_travel_through_the_registry() {
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = PluginRegistry::new(bus.clone() as Arc<dyn EventBus>, "/tmp");
    let (proxy, _server) = connect(tasks()).await;
    registry.register_subprocess(proxy).await.unwrap();

    let open = registry
        .query(&EntityQuery::of_type("task").with_filter("status", json!("open")))
        .await
        .unwrap();
    let ids: Vec<&str> = open.iter().map(|e| e.id()).collect();
    assert_eq!(ids, vec!["t-1", "t-3"]);
    assert_eq!(open[0].entity_type(), "task");

    let one = registry.get_entity("t-2").await.unwrap();
    assert_eq!(one.field("status"), Some(json!("done")));
    assert!(registry.get_entity("t-404").await.unwrap_err().is_not_found());

    let mut fields = Map::new();
    fields.insert("status".into(), json!("done"));
    let updated = registry.update_entity("t-1", fields.clone()).await.unwrap();
    assert_eq!(updated.field("status"), Some(json!("done")));

    match registry.update_entity("t-3", fields).await {
        Err(RegistryError::Plugin(PluginError::ReadOnly(_))) => {}
        other => panic!("expected read-only, got {:?}", other.map(|e| e.id().to_string())),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn commands_report_exit_codes_and_output() {
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = PluginRegistry::new(bus as Arc<dyn EventBus>, "/tmp");
    let (proxy, _server) = connect(tasks()).await;
    registry.register_subprocess(proxy).await.unwrap();

    let out = SharedBuffer::new();
    let report = registry
        .execute_command("tasks", "echo", &["hello".into(), "world".into()], Box::new(out.clone()))
        .await
        .unwrap();
    assert!(report.success());
    assert_eq!(out.contents(), "hello world\n");

    let report = registry
        .execute_command("tasks", "fail", &[], Box::new(SharedBuffer::new()))
        .await
        .unwrap();
    assert_eq!(report.exit_code, 3);
    assert_eq!(report.error.as_deref(), Some("failed on purpose"));

    let missing = registry
        .execute_command("tasks", "nope", &[], Box::new(SharedBuffer::new()))
        .await
        .unwrap_err();
    assert!(matches!(missing, RegistryError::UnknownCommand { .. }));
    registry.shutdown().await;
}

#[tokio::test]
async fn plugin_events_are_bridged_onto_the_bus() {
    let bus = Arc::new(InMemoryEventBus::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        EventFilter::for_type("task.*"),
        handler_fn(move |event: BusEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    let registry = PluginRegistry::new(bus.clone() as Arc<dyn EventBus>, "/tmp");
    let (proxy, server) = connect(tasks()).await;
    registry.register_subprocess(proxy).await.unwrap();

    // updates make the mock emit `task.updated`
    registry.update_entity("t-2", Map::new()).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, "task.updated");
    assert_eq!(event.source, "tasks");
    assert_eq!(event.payload_json(), Some(json!({"id": "t-2"})));
    assert!(event.timestamp.is_some());

    registry.shutdown().await;
    // closing the pipe ends the serve loop
    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap().unwrap();
}
