//! Cross-thread bridge behavior of the event bus.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use unmasking_core::error::{Result, UnmaskingError};
use unmasking_core::event::{Event, EventBus, EventHandler, EventMeta, ProgressEvent, SenderKind};

struct Recorder {
    seen: Mutex<Vec<u64>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn serials(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, _name: &str, event: &Event, _sender: SenderKind) -> Result<()> {
        self.seen.lock().unwrap().push(event.meta().serial);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    async fn handle(&self, _name: &str, _event: &Event, _sender: SenderKind) -> Result<()> {
        Err(UnmaskingError::EventType("rejected".to_string()))
    }
}

fn progress(serial: u64) -> Event {
    Event::Progress(ProgressEvent::new(EventMeta::new("group", serial), None))
}

#[tokio::test]
async fn test_worker_events_arrive_in_publish_order() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("progress", recorder.clone(), None);

    let scope = bus.open_bridge().unwrap();
    let publisher = bus.worker_publisher();
    tokio::task::spawn_blocking(move || {
        for serial in 0..32 {
            publisher.publish("progress", progress(serial), SenderKind::Strategy);
        }
    })
    .await
    .unwrap();
    scope.close().await.unwrap();

    assert_eq!(recorder.serials(), (0..32).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_closed_scope_drained_every_pending_event() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("progress", recorder.clone(), None);

    let scope = bus.open_bridge().unwrap();
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let publisher = bus.worker_publisher();
            tokio::task::spawn_blocking(move || {
                for i in 0..8 {
                    publisher.publish("progress", progress(w * 100 + i), SenderKind::Strategy);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }
    scope.close().await.unwrap();

    // no cross-publisher ordering guarantee, but nothing may be lost and
    // each publisher's serials must stay in order
    let seen = recorder.serials();
    assert_eq!(seen.len(), 32);
    for w in 0..4u64 {
        let per_worker: Vec<u64> = seen.iter().copied().filter(|s| s / 100 == w).collect();
        assert_eq!(per_worker, (0..8).map(|i| w * 100 + i).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn test_terminated_bridge_drops_worker_events() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("progress", recorder.clone(), None);

    let scope = bus.open_bridge().unwrap();
    let publisher = bus.worker_publisher();
    bus.terminate();
    assert!(publisher.terminated());
    publisher.publish("progress", progress(0), SenderKind::Strategy);
    scope.close().await.unwrap();

    assert!(recorder.serials().is_empty());
}

#[tokio::test]
async fn test_handler_failure_drops_event_but_keeps_consumer_alive() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("poison", Arc::new(Failing), None);
    bus.subscribe("progress", recorder.clone(), None);

    let scope = bus.open_bridge().unwrap();
    let publisher = bus.worker_publisher();
    tokio::task::spawn_blocking(move || {
        publisher.publish("poison", progress(0), SenderKind::Strategy);
        publisher.publish("progress", progress(1), SenderKind::Strategy);
    })
    .await
    .unwrap();
    scope.close().await.unwrap();

    // the failing event is logged and dropped; later events still arrive
    assert_eq!(recorder.serials(), vec![1]);
}

#[tokio::test]
async fn test_sender_filter_applies_to_bridged_events() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("progress", recorder.clone(), Some(&[SenderKind::Strategy]));

    let scope = bus.open_bridge().unwrap();
    let publisher = bus.worker_publisher();
    tokio::task::spawn_blocking(move || {
        publisher.publish("progress", progress(0), SenderKind::JobEngine);
        publisher.publish("progress", progress(1), SenderKind::Strategy);
    })
    .await
    .unwrap();
    scope.close().await.unwrap();

    assert_eq!(recorder.serials(), vec![1]);
}

#[tokio::test]
async fn test_bridge_scope_can_be_reopened_after_close() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::new();
    bus.subscribe("progress", recorder.clone(), None);

    for round in 0..3u64 {
        let scope = bus.open_bridge().unwrap();
        let publisher = bus.worker_publisher();
        tokio::task::spawn_blocking(move || {
            publisher.publish("progress", progress(round), SenderKind::Strategy);
        })
        .await
        .unwrap();
        scope.close().await.unwrap();
    }

    assert_eq!(recorder.serials(), vec![0, 1, 2]);
}
