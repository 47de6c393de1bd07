use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dw_plugin::event::{BusError, BusEvent, EventBus, EventFilter, EventHandler};
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_log::EventLog;
use crate::logger::metrics;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a replaying subscription starts reading the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStart {
    Beginning,
    /// Exclusive.
    AfterSequence(u64),
    /// Events stamped at or after this instant.
    Since(DateTime<Utc>),
}

struct Subscription {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<BusEvent>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<String, Subscription>,
    closed: bool,
}

/// In-process pub/sub router.
///
/// Each subscription owns a worker task fed by an unbounded queue, so a
/// slow handler only delays its own deliveries and never the publisher.
/// The state lock covers bookkeeping, log appends and queue sends; no
/// handler runs under it.
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
    log: Option<Arc<dyn EventLog>>,
    handler_timeout: Duration,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            log: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Persist every published event; enables replay.
    pub fn with_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Deliver logged events after `start` up to now, then live ones, each
    /// exactly once and in order.
    pub async fn subscribe_with_replay(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
        start: ReplayStart,
    ) -> Result<String, BusError> {
        let log = self.log.clone().ok_or(BusError::NoEventLog)?;

        let (backlog_tx, backlog_rx) = oneshot::channel();
        let (id, cutover) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BusError::Closed);
            }
            // publish appends under the same lock, so everything above the
            // cutover reaches us through the queue and nothing at or below it does
            let cutover = log.last_sequence().await.map_err(|e| BusError::Log(e.to_string()))?;
            let id = self.register(&mut state, filter.clone(), handler, Some(backlog_rx));
            (id, cutover)
        };

        let after = match start {
            ReplayStart::AfterSequence(seq) => seq,
            ReplayStart::Beginning | ReplayStart::Since(_) => 0,
        };
        let entries = match log.read(after, cutover).await {
            Ok(entries) => entries,
            Err(e) => {
                self.unsubscribe(&id).await;
                return Err(BusError::Log(e.to_string()));
            }
        };
        let backlog: Vec<BusEvent> = entries
            .into_iter()
            .map(|e| e.event)
            .filter(|e| match start {
                ReplayStart::Since(since) => e.timestamp.is_some_and(|t| t >= since),
                _ => true,
            })
            .filter(|e| filter.matches(e))
            .collect();
        debug!(subscription = %id, replayed = backlog.len(), cutover, "replay subscription started");
        let _ = backlog_tx.send(backlog);
        Ok(id)
    }

    /// Terminate every subscription. Queued deliveries finish first; later
    /// publishes fail with [`BusError::Closed`].
    pub async fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.subscriptions.drain().map(|(_, sub)| sub.worker).collect()
        };
        let count = workers.len();
        futures::future::join_all(workers).await;
        info!(subscriptions = count, "event bus shut down");
    }

    fn register(
        &self,
        state: &mut BusState,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
        backlog: Option<oneshot::Receiver<Vec<BusEvent>>>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_subscription(id.clone(), handler, backlog, rx, self.handler_timeout));
        state.subscriptions.insert(id.clone(), Subscription { filter, tx, worker });
        id
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, mut event: BusEvent) -> Result<String, BusError> {
        if event.event_type.is_empty() {
            return Err(BusError::MissingType);
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.append(&event).await {
                warn!(event_id = %event.id, error = %e, "failed to persist event, delivering anyway");
            }
        }
        let mut delivered = 0;
        for sub in state.subscriptions.values() {
            if sub.filter.matches(&event) && sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        drop(state);

        metrics()
            .bus_events_published
            .add(1, &[KeyValue::new("type", event.event_type.clone())]);
        debug!(event_id = %event.id, event_type = %event.event_type, source = %event.source, delivered, "event published");
        Ok(event.id)
    }

    async fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Result<String, BusError> {
        let id = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BusError::Closed);
            }
            self.register(&mut state, filter, handler, None)
        };
        debug!(subscription = %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> bool {
        // dropping the sender lets the worker drain what is already queued
        let removed = self.state.lock().await.subscriptions.remove(subscription_id).is_some();
        if removed {
            debug!(subscription = %subscription_id, "unsubscribed");
        }
        removed
    }
}

async fn run_subscription(
    id: String,
    handler: Arc<dyn EventHandler>,
    backlog: Option<oneshot::Receiver<Vec<BusEvent>>>,
    mut rx: mpsc::UnboundedReceiver<BusEvent>,
    timeout: Duration,
) {
    // a dropped backlog sender means the replay was abandoned
    if let Some(backlog) = backlog {
        for event in backlog.await.unwrap_or_default() {
            deliver(&id, handler.as_ref(), event, timeout).await;
        }
    }
    while let Some(event) = rx.recv().await {
        deliver(&id, handler.as_ref(), event, timeout).await;
    }
    debug!(subscription = %id, "subscription worker finished");
}

async fn deliver(id: &str, handler: &dyn EventHandler, event: BusEvent, timeout: Duration) {
    let event_id = event.id.clone();
    let event_type = event.event_type.clone();
    let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();
    let failure = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => return,
        Ok(Ok(Err(e))) => format!("handler failed: {e:#}"),
        Ok(Err(_)) => "handler panicked".to_string(),
        Err(_) => format!("handler timed out after {timeout:?}"),
    };
    metrics()
        .bus_handler_failures
        .add(1, &[KeyValue::new("type", event_type.clone())]);
    warn!(subscription = %id, %event_id, %event_type, "{failure}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_plugin::event::handler_fn;

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_subscribe() {
        let bus = InMemoryEventBus::new();
        bus.subscribe(EventFilter::new(), handler_fn(|_| async { Ok(()) })).await.unwrap();
        bus.shutdown().await;
        assert_eq!(bus.subscription_count().await, 0);
        assert_eq!(bus.publish(BusEvent::new("a.b", "t")).await, Err(BusError::Closed));
        assert!(bus.subscribe(EventFilter::new(), handler_fn(|_| async { Ok(()) })).await.is_err());
    }

    #[tokio::test]
    async fn publish_assigns_identity() {
        let bus = InMemoryEventBus::new();
        let id = bus.publish(BusEvent::new("a.b", "t")).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(bus.publish(BusEvent::new("", "t")).await, Err(BusError::MissingType));
    }

    #[tokio::test]
    async fn replay_needs_a_log() {
        let bus = InMemoryEventBus::new();
        let err = bus
            .subscribe_with_replay(EventFilter::new(), handler_fn(|_| async { Ok(()) }), ReplayStart::Beginning)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::NoEventLog);
    }
}
