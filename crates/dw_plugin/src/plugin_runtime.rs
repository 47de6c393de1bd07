//! Async runtime that wires **stdin / stdout** JSON‑RPC traffic to a
//! user‑supplied [`Plugin`] implementation, turning it into a subprocess
//! plugin any darwinflow host can load.
//!
//! * Requests → method dispatch → JSON‑RPC response
//! * Notifications (no `id`) → dispatched, never answered
//! * Events emitted through the plugin's sink → `RpcEvent` lines, but only
//!   between `start_event_stream` and `stop_event_stream`
//!
//! Usage:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     dw_plugin::plugin_runtime::run(std::sync::Arc::new(MyPlugin::default())).await
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

use crate::capability::EntityQuery;
use crate::command::{CommandContext, CommandInfo, SharedBuffer};
use crate::entity::to_wire;
use crate::error::PluginError;
use crate::jsonrpc::{
    ExecuteCommandParams, ExecuteCommandResult, GetEntityParams, Id, InitParams, JSONRPC_VERSION, Method, Request,
    Response, RpcEvent, UpdateEntityParams, codes,
};
use crate::plugin::{EventSink, Plugin, PluginContext, PluginEvent};

/// Runs the JSON‑RPC stdin/stdout loop until EOF.
pub async fn run(plugin: Arc<dyn Plugin>) -> Result<()> {
    serve(plugin, io::stdin(), io::stdout()).await
}

/// Same as [`run`] over arbitrary pipes. Returns once `reader` hits EOF and
/// every queued line has been flushed.
pub async fn serve<R, W>(plugin: Arc<dyn Plugin>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                error!("stdout write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                error!("stdout flush error");
                break;
            }
        }
    });

    let name = plugin.info().name;
    let sink = Arc::new(StreamSink {
        source: name.clone(),
        streaming: AtomicBool::new(false),
        tx: tx.clone(),
    });
    let state = ServeState {
        plugin: plugin.clone(),
        name,
        working_dir: Mutex::new(PathBuf::from(".")),
        sink,
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let req = match serde_json::from_str::<Request>(line) {
            Ok(req) => req,
            Err(e) => {
                enqueue(&tx, Response::fail(Id::Null, codes::PARSE_ERROR, "Parse error", Some(json!(e.to_string()))));
                continue;
            }
        };
        if req.jsonrpc != JSONRPC_VERSION || req.method.is_empty() {
            if let Some(id) = req.id {
                enqueue(&tx, Response::fail(id, codes::INVALID_REQUEST, "Invalid request", None));
            }
            continue;
        }
        let id = req.id.clone();
        let response = state.handle_request(req).await;
        if let Some(id) = id {
            enqueue(&tx, response.into_response(id));
        }
    }

    if let Err(err) = plugin.shutdown().await {
        warn!("plugin shutdown failed: {err}");
    }
    drop(state);
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

/// Helper that serialises a frame and sends it to the writer queue.
fn enqueue<T: Serialize>(tx: &UnboundedSender<String>, frame: T) {
    match serde_json::to_string(&frame) {
        Ok(s) => {
            let _ = tx.send(format!("{s}\n"));
        }
        Err(e) => error!("could not encode frame: {e}"),
    }
}

/// Forwards plugin events as `RpcEvent` lines while streaming is on.
struct StreamSink {
    source: String,
    streaming: AtomicBool,
    tx: UnboundedSender<String>,
}

#[async_trait]
impl EventSink for StreamSink {
    async fn emit(&self, event: PluginEvent) -> Result<(), PluginError> {
        if !self.streaming.load(Ordering::SeqCst) {
            debug!(event = %event.event_type, "event stream not started, dropping event");
            return Ok(());
        }
        let mut frame = RpcEvent::new(event.event_type, self.source.clone(), event.payload);
        if !event.labels.is_empty() {
            frame.metadata = Some(event.labels);
        }
        frame.version = event.version;
        enqueue(&self.tx, frame);
        Ok(())
    }
}

enum Outcome {
    Ok(Value),
    Err(i64, String, Option<Value>),
}

impl Outcome {
    fn from_result<T: Serialize>(res: Result<T, PluginError>) -> Self {
        match res {
            Ok(v) => match serde_json::to_value(v) {
                Ok(v) => Outcome::Ok(v),
                Err(e) => Outcome::Err(codes::INTERNAL_ERROR, format!("failed to encode result: {e}"), None),
            },
            Err(err) => {
                let rpc = err.to_rpc();
                Outcome::Err(rpc.code, rpc.message, rpc.data)
            }
        }
    }

    fn method_not_found(method: &str) -> Self {
        Outcome::Err(codes::METHOD_NOT_FOUND, format!("method not found: {method}"), None)
    }

    fn into_response(self, id: Id) -> Response {
        match self {
            Outcome::Ok(v) => Response::success(id, v),
            Outcome::Err(code, msg, data) => Response::fail(id, code, msg, data),
        }
    }
}

struct ServeState {
    plugin: Arc<dyn Plugin>,
    name: String,
    working_dir: Mutex<PathBuf>,
    sink: Arc<StreamSink>,
}

fn params<T: DeserializeOwned>(raw: Option<Value>) -> Result<T, Outcome> {
    serde_json::from_value(raw.unwrap_or(Value::Null))
        .map_err(|e| Outcome::Err(codes::INVALID_PARAMS, format!("invalid params: {e}"), None))
}

impl ServeState {
    fn working_dir(&self) -> PathBuf {
        self.working_dir.lock().map(|d| d.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    async fn handle_request(&self, req: Request) -> Outcome {
        let method = match req.method.parse::<Method>() {
            Ok(m) => m,
            Err(_) => return Outcome::method_not_found(&req.method),
        };
        match self.dispatch(method, req.params).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn dispatch(&self, method: Method, raw: Option<Value>) -> Result<Outcome, Outcome> {
        let plugin = self.plugin.as_ref();
        let outcome = match method {
            Method::Init => {
                let p: InitParams = params(raw)?;
                let dir = PathBuf::from(&p.working_dir);
                if let Ok(mut wd) = self.working_dir.lock() {
                    *wd = dir.clone();
                }
                let ctx = PluginContext::new(self.name.clone(), dir, self.sink.clone()).with_config(p.config);
                Outcome::from_result(plugin.initialize(ctx).await.map(|_| Value::Null))
            }
            Method::GetInfo => Outcome::from_result(Ok(plugin.info())),
            Method::GetCapabilities => Outcome::from_result(Ok(plugin.capabilities())),
            Method::GetEntityTypes => {
                let provider = plugin.as_entity_provider().ok_or_else(|| Outcome::method_not_found("get_entity_types"))?;
                Outcome::from_result(Ok(provider.entity_types()))
            }
            Method::QueryEntities => {
                let provider = plugin.as_entity_provider().ok_or_else(|| Outcome::method_not_found("query_entities"))?;
                let query: EntityQuery = if raw.as_ref().is_none_or(Value::is_null) { EntityQuery::default() } else { params(raw)? };
                let res = provider
                    .query(&query)
                    .await
                    .map(|entities| entities.iter().map(|e| to_wire(e.as_ref())).collect::<Vec<_>>());
                Outcome::from_result(res)
            }
            Method::GetEntity => {
                let provider = plugin.as_entity_provider().ok_or_else(|| Outcome::method_not_found("get_entity"))?;
                let p: GetEntityParams = params(raw)?;
                Outcome::from_result(provider.get_entity(&p.entity_id).await.map(|e| to_wire(e.as_ref())))
            }
            Method::UpdateEntity => {
                let updater = plugin.as_entity_updater().ok_or_else(|| Outcome::method_not_found("update_entity"))?;
                let p: UpdateEntityParams = params(raw)?;
                Outcome::from_result(updater.update_entity(&p.entity_id, p.fields).await.map(|e| to_wire(e.as_ref())))
            }
            Method::GetCommands => {
                let provider = plugin.as_command_provider().ok_or_else(|| Outcome::method_not_found("get_commands"))?;
                let infos: Vec<CommandInfo> = provider.commands().iter().map(|c| c.info()).collect();
                Outcome::from_result(Ok(infos))
            }
            Method::ExecuteCommand => {
                let provider = plugin.as_command_provider().ok_or_else(|| Outcome::method_not_found("execute_command"))?;
                let p: ExecuteCommandParams = params(raw)?;
                let command = provider
                    .commands()
                    .into_iter()
                    .find(|c| c.info().name == p.command_name)
                    .ok_or_else(|| Outcome::from_result::<()>(Err(PluginError::NotFound(format!("command {}", p.command_name)))))?;

                let out = SharedBuffer::new();
                let mut ctx = CommandContext::new(self.name.clone(), self.working_dir())
                    .with_stdout(out.clone())
                    .with_events(self.sink.clone());
                let result = match command.execute(&mut ctx, &p.args).await {
                    Ok(()) => ExecuteCommandResult { exit_code: 0, output: out.contents(), error: String::new() },
                    Err(err) => ExecuteCommandResult {
                        exit_code: err.exit_code(),
                        output: out.contents(),
                        error: err.message(),
                    },
                };
                Outcome::from_result(Ok(result))
            }
            Method::StartEventStream => {
                plugin.as_event_emitter().ok_or_else(|| Outcome::method_not_found("start_event_stream"))?;
                self.sink.streaming.store(true, Ordering::SeqCst);
                Outcome::Ok(Value::Null)
            }
            Method::StopEventStream => {
                self.sink.streaming.store(false, Ordering::SeqCst);
                Outcome::Ok(Value::Null)
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilitySet, PluginInfo};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    struct InfoOnly;

    #[async_trait]
    impl Plugin for InfoOnly {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("info-only", "0.1.0", "answers get_info")
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new()
        }
    }

    async fn roundtrip(lines: &[&str]) -> Vec<Value> {
        let (mut host_w, plugin_r) = duplex(4096);
        let (plugin_w, host_r) = duplex(4096);
        let server = tokio::spawn(serve(Arc::new(InfoOnly), plugin_r, plugin_w));
        for l in lines {
            host_w.write_all(format!("{l}\n").as_bytes()).await.unwrap();
        }
        drop(host_w);
        server.await.unwrap().unwrap();
        let mut out = Vec::new();
        let mut rdr = BufReader::new(host_r).lines();
        while let Some(l) = rdr.next_line().await.unwrap() {
            out.push(serde_json::from_str(&l).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn answers_core_methods_and_rejects_undeclared_ones() {
        let out = roundtrip(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"get_info"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"get_entity_types"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"no_such_method"}"#,
            r#"{"jsonrpc":"2.0","method":"get_info"}"#,
        ])
        .await;
        assert_eq!(out.len(), 3, "notifications get no answer");
        assert_eq!(out[0]["result"]["name"], "info-only");
        assert_eq!(out[1]["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(out[2]["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn garbage_and_bad_params_get_protocol_errors() {
        let out = roundtrip(&[
            "{not json",
            r#"{"jsonrpc":"2.0","id":5,"method":"init","params":{"config":{}}}"#,
            r#"{"jsonrpc":"1.0","id":6,"method":"get_info"}"#,
        ])
        .await;
        assert_eq!(out[0]["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(out[0]["id"], Value::Null);
        assert_eq!(out[1]["error"]["code"], codes::INVALID_PARAMS);
        assert_eq!(out[2]["error"]["code"], codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn events_only_flow_while_streaming() {
        let sink_tx = mpsc::unbounded_channel::<String>();
        let sink = StreamSink { source: "p".into(), streaming: AtomicBool::new(false), tx: sink_tx.0 };
        let mut rx = sink_tx.1;

        sink.emit(PluginEvent::new("early")).await.unwrap();
        assert!(rx.try_recv().is_err());

        sink.streaming.store(true, Ordering::SeqCst);
        sink.emit(PluginEvent::new("note.updated").with_label("k", "v")).await.unwrap();
        let line = rx.try_recv().unwrap();
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["event"], "event");
        assert_eq!(v["type"], "note.updated");
        assert_eq!(v["source"], "p");
        assert_eq!(v["metadata"]["k"], "v");
    }
}
