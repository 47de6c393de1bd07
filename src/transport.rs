use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dw_plugin::jsonrpc::{Id, Incoming, Method, Request, Response, RpcEvent};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_IN_FLIGHT, DEFAULT_TIMEOUT_SECS, SubprocessConfig};
use crate::error::TransportError;
use crate::logger::metrics;

/// Grace period between closing a plugin's stdin and killing it.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

type Pending = Arc<DashMap<String, oneshot::Sender<Response>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Host side of one plugin's JSON-RPC channel.
///
/// A reader task owns the plugin's output: responses are matched to their
/// waiter by id, events are forwarded to the channel given at construction,
/// so events keep flowing while requests are outstanding. When the stream
/// ends every waiter fails with [`TransportError::ProcessTerminated`].
pub struct RpcClient {
    name: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: Pending,
    next_id: AtomicI64,
    slots: Semaphore,
    timeout: Duration,
    terminated: watch::Sender<bool>,
    child: Mutex<Option<Child>>,
}

impl RpcClient {
    /// Wire a client to an arbitrary byte stream pair. Must be called inside
    /// a tokio runtime.
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W, options: ClientOptions, events: mpsc::UnboundedSender<RpcEvent>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let pending: Pending = Arc::new(DashMap::new());
        let (terminated, _) = watch::channel(false);
        tokio::spawn(read_loop(name.clone(), reader, pending.clone(), events, terminated.clone()));
        Self {
            name,
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            next_id: AtomicI64::new(1),
            slots: Semaphore::new(options.max_in_flight.max(1)),
            timeout: options.timeout,
            terminated,
            child: Mutex::new(None),
        }
    }

    /// Launch the configured executable and talk to it over stdio.
    pub fn spawn(config: &SubprocessConfig, events: mpsc::UnboundedSender<RpcEvent>) -> Result<Self, TransportError> {
        let command = config.program.display().to_string();
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .envs(&config.env)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn { command: command.clone(), source })?;

        let missing = |what: &str| TransportError::Spawn {
            command: command.clone(),
            source: std::io::Error::other(format!("no {what} pipe")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(config.name.clone(), stderr));
        }
        info!(plugin = %config.name, pid = ?child.id(), command = %command, "plugin process started");

        let options = ClientOptions { timeout: config.timeout, max_in_flight: config.max_in_flight };
        let client = Self::new(config.name.clone(), stdout, stdin, options, events);
        Ok(Self { child: Mutex::new(Some(child)), ..client })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        !*self.terminated.borrow()
    }

    /// Requests written and not yet answered, timed out or cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolves once the plugin's output stream has ended.
    pub async fn wait_terminated(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Send a request and decode the result.
    pub async fn request<P, T>(&self, method: Method, params: Option<&P>) -> Result<T, TransportError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::MalformedFrame(format!("unexpected `{method}` result: {e}")))
    }

    /// Send a request and wait for its response, bounded by the timeout.
    ///
    /// One deadline covers waiting for a slot, writing the frame and waiting
    /// for the answer. Dropping the returned future frees the pending slot.
    pub async fn call(&self, method: Method, params: Option<Value>) -> Result<Value, TransportError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let timed_out = || {
            warn!(plugin = %self.name, %method, "rpc request timed out after {:?}", self.timeout);
            TransportError::Timeout { method: method.to_string(), after: self.timeout }
        };

        let _permit = tokio::time::timeout_at(deadline, self.slots.acquire())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| TransportError::ProcessTerminated)?;
        if !self.is_alive() {
            return Err(TransportError::ProcessTerminated);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard::new(&self.pending, Id::Number(id).key());
        self.pending.insert(guard.key.clone(), tx);
        // the reader may have drained the table before the insert
        if !self.is_alive() {
            return Err(TransportError::ProcessTerminated);
        }

        let frame = serde_json::to_string(&Request::call(Id::Number(id), method, params))
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        debug!(plugin = %self.name, %method, id, "rpc request");
        let attrs = [KeyValue::new("plugin", self.name.clone()), KeyValue::new("method", method.to_string())];
        metrics().rpc_requests.add(1, &attrs);
        let started = Instant::now();

        let written = match tokio::time::timeout_at(deadline, self.write_line(&frame)).await {
            Ok(written) => written,
            Err(_) => Err(timed_out()),
        };
        if let Err(err) = written {
            metrics().rpc_failures.add(1, &attrs);
            return Err(err);
        }

        let outcome = match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => Err(timed_out()),
            Ok(Err(_)) => Err(TransportError::ProcessTerminated),
            Ok(Ok(response)) => response.into_result().map_err(TransportError::Rpc),
        };
        metrics().rpc_latency_ms.record(started.elapsed().as_secs_f64() * 1_000.0, &attrs);
        if outcome.is_err() {
            metrics().rpc_failures.add(1, &attrs);
        }
        outcome
    }

    /// Fire-and-forget request without an id.
    pub async fn notify(&self, method: Method, params: Option<Value>) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&Request::notification(method, params))
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        self.write_line(&frame).await
    }

    async fn write_line(&self, frame: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ProcessTerminated)?;
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(TransportError::ProcessTerminated),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Close the plugin's stdin, give it [`STOP_GRACE`] to exit, then kill it.
    pub async fn stop(&self) {
        self.writer.lock().await.take();
        let Some(mut child) = self.child.lock().await.take() else {
            let _ = tokio::time::timeout(STOP_GRACE, self.wait_terminated()).await;
            return;
        };
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(plugin = %self.name, %status, "plugin exited"),
            Ok(Err(e)) => warn!(plugin = %self.name, error = %e, "waiting for plugin failed"),
            Err(_) => {
                warn!(plugin = %self.name, "plugin ignored stdin close, killing");
                if let Err(e) = child.kill().await {
                    warn!(plugin = %self.name, error = %e, "kill failed");
                }
            }
        }
    }
}

/// Removes the waiter when the call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    key: String,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a Pending, key: String) -> Self {
        Self { pending, key }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

async fn read_loop<R>(
    name: String,
    reader: R,
    pending: Pending,
    events: mpsc::UnboundedSender<RpcEvent>,
    terminated: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Incoming::parse(&line) {
                    Ok(Incoming::Event(event)) => {
                        debug!(plugin = %name, event_type = %event.event_type, "plugin event");
                        if events.send(event).is_err() {
                            debug!(plugin = %name, "no event consumer, dropping event");
                        }
                    }
                    Ok(Incoming::Response(response)) => {
                        let key = response.id.key();
                        match pending.remove(&key) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(response);
                            }
                            None => warn!(plugin = %name, id = %key, "discarding response with unknown id"),
                        }
                    }
                    Err(e) => warn!(plugin = %name, error = %e, "discarding malformed frame"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %name, error = %e, "reading plugin output failed");
                break;
            }
        }
    }
    terminated.send_replace(true);
    let outstanding = pending.len();
    // dropping the senders wakes every waiter with ProcessTerminated
    pending.clear();
    info!(plugin = %name, outstanding, "plugin output closed");
}

async fn drain_stderr<R>(name: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %name, "stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, duplex};

    struct Wire {
        client: RpcClient,
        events: mpsc::UnboundedReceiver<RpcEvent>,
        plugin_in: tokio::io::Lines<BufReader<DuplexStream>>,
        plugin_out: DuplexStream,
    }

    fn wire(options: ClientOptions) -> Wire {
        let (host_to_plugin, plugin_stdin) = duplex(64 * 1024);
        let (plugin_stdout, host_from_plugin) = duplex(64 * 1024);
        let (tx, events) = mpsc::unbounded_channel();
        let client = RpcClient::new("test", host_from_plugin, host_to_plugin, options, tx);
        Wire { client, events, plugin_in: BufReader::new(plugin_stdin).lines(), plugin_out: plugin_stdout }
    }

    #[tokio::test]
    async fn dropped_call_frees_its_slot() {
        let mut w = wire(ClientOptions::default());
        {
            let call = w.client.call(Method::GetInfo, None);
            let _ = tokio::time::timeout(Duration::from_millis(50), call).await;
        }
        assert_eq!(w.client.pending_count(), 0);
        let line = w.plugin_in.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"get_info\""));
        drop(w.plugin_out);
        w.client.wait_terminated().await;
        assert!(!w.client.is_alive());
        assert!(w.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rpc_errors_are_not_transport_failures() {
        let mut w = wire(ClientOptions::default());
        let client = Arc::new(w.client);
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call(Method::GetEntity, Some(json!({"entity_id": "x"}))).await })
        };
        let req: Value = serde_json::from_str(&w.plugin_in.next_line().await.unwrap().unwrap()).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32001, "message": "missing"}});
        w.plugin_out.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        match caller.await.unwrap() {
            Err(TransportError::Rpc(e)) => assert_eq!(e.code, -32001),
            other => panic!("unexpected {other:?}"),
        }
    }
}
