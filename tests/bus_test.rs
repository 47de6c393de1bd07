use std::sync::{Arc, Mutex};
use std::time::Duration;

use darwinflow::bus::{InMemoryEventBus, ReplayStart};
use darwinflow::event_log::{EventLog, MemoryEventLog};
use dw_plugin::event::{BusEvent, EventBus, EventFilter, EventHandler, handler_fn};
use serde_json::json;
use tokio::sync::mpsc;

/// Handler that forwards every event type it sees.
fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event: BusEvent| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.event_type);
            Ok(())
        }
    });
    (handler, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("channel closed")
}

/// No event within 100ms; a closed channel counts as quiet.
async fn nothing_more(rx: &mut mpsc::UnboundedReceiver<String>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected delivery of {event}");
    }
}

#[test]
fn filter_globs_labels_and_source() {
    let email = BusEvent::new("gmail.email_received", "gmail")
        .with_label("label", "Inbox")
        .with_label("account", "me");

    assert!(EventFilter::new().matches(&email));
    assert!(EventFilter::for_type("*").matches(&email));
    assert!(EventFilter::for_type("gmail.*").matches(&email));
    assert!(EventFilter::for_type("*.email_received").matches(&email));
    assert!(EventFilter::for_type("gmail.email_receive?").matches(&email));
    assert!(!EventFilter::for_type("gmail.email").matches(&email));
    assert!(!EventFilter::for_type("slack.*").matches(&email));

    assert!(EventFilter::new().label("label", "Inbox").matches(&email));
    assert!(!EventFilter::new().label("label", "Spam").matches(&email));
    assert!(!EventFilter::new().label("thread", "1").matches(&email));

    assert!(EventFilter::new().source("gmail").matches(&email));
    assert!(!EventFilter::new().source("gmail-sync").matches(&email));
}

#[test]
fn regex_metacharacters_are_literal() {
    let filter = EventFilter::for_type("a.b");
    assert!(filter.matches(&BusEvent::new("a.b", "s")));
    assert!(!filter.matches(&BusEvent::new("axb", "s")));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = InMemoryEventBus::new();
    let (handler, mut rx) = collector();
    let id = bus.subscribe(EventFilter::for_type("note.*"), handler).await.unwrap();

    bus.publish(BusEvent::new("note.created", "notes")).await.unwrap();
    bus.publish(BusEvent::new("task.created", "tasks")).await.unwrap();
    assert_eq!(next(&mut rx).await, "note.created");

    assert!(bus.unsubscribe(&id).await);
    assert!(!bus.unsubscribe(&id).await);
    assert!(!bus.unsubscribe("never-existed").await);

    bus.publish(BusEvent::new("note.updated", "notes")).await.unwrap();
    nothing_more(&mut rx).await;
    assert_eq!(bus.subscription_count().await, 0);
}

#[tokio::test]
async fn repeated_unsubscribe_leaves_other_subscriptions_alone() {
    let bus = InMemoryEventBus::new();
    let (gone, mut gone_rx) = collector();
    let (kept, mut kept_rx) = collector();
    let id = bus.subscribe(EventFilter::for_type("note.*"), gone).await.unwrap();
    bus.subscribe(EventFilter::for_type("note.*"), kept).await.unwrap();

    assert!(bus.unsubscribe(&id).await);
    assert!(!bus.unsubscribe(&id).await);
    assert_eq!(bus.subscription_count().await, 1);

    bus.publish(BusEvent::new("note.created", "notes")).await.unwrap();
    assert_eq!(next(&mut kept_rx).await, "note.created");
    nothing_more(&mut gone_rx).await;
}

#[tokio::test]
async fn events_without_type_are_rejected() {
    let bus = InMemoryEventBus::new();
    let err = bus.publish(BusEvent::new("", "x")).await.unwrap_err();
    assert_eq!(err, dw_plugin::event::BusError::MissingType);
}

#[tokio::test]
async fn each_subscriber_sees_publish_order() {
    let bus = InMemoryEventBus::new();
    let (first, mut rx1) = collector();
    let (second, mut rx2) = collector();
    bus.subscribe(EventFilter::new(), first).await.unwrap();
    bus.subscribe(EventFilter::new(), second).await.unwrap();

    for i in 0..50 {
        bus.publish(BusEvent::new(format!("tick.{i}"), "clock")).await.unwrap();
    }
    for rx in [&mut rx1, &mut rx2] {
        for i in 0..50 {
            assert_eq!(next(rx).await, format!("tick.{i}"));
        }
    }
}

#[tokio::test]
async fn slow_or_failing_handlers_do_not_block_others() {
    let bus = InMemoryEventBus::new().with_handler_timeout(Duration::from_millis(50));

    bus.subscribe(
        EventFilter::new(),
        handler_fn(|_event: BusEvent| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }),
    )
    .await
    .unwrap();
    bus.subscribe(EventFilter::new(), handler_fn(|_event: BusEvent| async { anyhow::bail!("handler broke") }))
        .await
        .unwrap();
    bus.subscribe(
        EventFilter::new(),
        handler_fn(|event: BusEvent| async move {
            if !event.event_type.is_empty() {
                panic!("handler panicked");
            }
            Ok(())
        }),
    )
    .await
    .unwrap();
    let (healthy, mut rx) = collector();
    bus.subscribe(EventFilter::new(), healthy).await.unwrap();

    let started = std::time::Instant::now();
    bus.publish(BusEvent::new("one", "t")).await.unwrap();
    bus.publish(BusEvent::new("two", "t")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(next(&mut rx).await, "one");
    assert_eq!(next(&mut rx).await, "two");
}

#[tokio::test]
async fn labelled_emails_reach_only_matching_subscribers() {
    let bus = InMemoryEventBus::new();
    let (inbox, mut inbox_rx) = collector();
    let (spam, mut spam_rx) = collector();
    bus.subscribe(EventFilter::for_type("gmail.*").label("label", "Inbox"), inbox)
        .await
        .unwrap();
    bus.subscribe(EventFilter::for_type("gmail.*").label("label", "Spam"), spam)
        .await
        .unwrap();

    let email = BusEvent::new("gmail.email_received", "gmail")
        .with_label("label", "Inbox")
        .with_json_payload(&json!({"subject": "hello"}))
        .unwrap();
    bus.publish(email).await.unwrap();

    assert_eq!(next(&mut inbox_rx).await, "gmail.email_received");
    nothing_more(&mut spam_rx).await;
}

#[tokio::test]
async fn replay_then_live_without_gaps_or_duplicates() {
    let log = Arc::new(MemoryEventLog::new());
    let bus = Arc::new(InMemoryEventBus::new().with_log(log.clone() as Arc<dyn EventLog>));
    for i in 0..20 {
        bus.publish(BusEvent::new(format!("old.{i}"), "t")).await.unwrap();
    }

    // keep publishing while the replaying subscriber attaches
    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                bus.publish(BusEvent::new(format!("live.{i}"), "t")).await.unwrap();
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn(move |event: BusEvent| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(event.id);
                Ok(())
            }
        })
    };
    bus.subscribe_with_replay(EventFilter::new(), handler, ReplayStart::Beginning)
        .await
        .unwrap();
    publisher.await.unwrap();

    let expected: Vec<String> = log
        .read(0, log.last_sequence().await.unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event.id)
        .collect();
    assert_eq!(expected.len(), 220);

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < expected.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replay did not catch up");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn replay_after_sequence_skips_older_events() {
    let log = Arc::new(MemoryEventLog::new());
    let bus = InMemoryEventBus::new().with_log(log as Arc<dyn EventLog>);
    for ty in ["a.1", "b.1", "a.2", "a.3"] {
        bus.publish(BusEvent::new(ty, "t")).await.unwrap();
    }
    let (handler, mut rx) = collector();
    bus.subscribe_with_replay(EventFilter::for_type("a.*"), handler, ReplayStart::AfterSequence(1))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, "a.2");
    assert_eq!(next(&mut rx).await, "a.3");
    bus.publish(BusEvent::new("a.4", "t")).await.unwrap();
    assert_eq!(next(&mut rx).await, "a.4");
    nothing_more(&mut rx).await;
}

#[tokio::test]
async fn shutdown_drains_queued_events() {
    let bus = InMemoryEventBus::new();
    let (handler, mut rx) = collector();
    bus.subscribe(EventFilter::new(), handler).await.unwrap();
    bus.publish(BusEvent::new("last", "t")).await.unwrap();
    bus.shutdown().await;
    assert_eq!(next(&mut rx).await, "last");
    assert!(bus.publish(BusEvent::new("late", "t")).await.is_err());
}
