//! In-process pub/sub with a cross-worker redelivery bridge.
//!
//! The bus dispatches events by name to subscribed handlers, in
//! subscription order, optionally filtered by sender type. Publishing is
//! only ever dispatched on the *controller thread* — the thread that
//! created the bus. A publish from any other thread (worker-pool threads
//! in particular) is enqueued on a FIFO channel instead; a single
//! consumer task drains that channel in arrival order and re-dispatches
//! each item locally. This preserves per-publisher ordering; no ordering
//! is guaranteed *across* concurrent publishers.
//!
//! Handler errors propagate synchronously to an in-process publisher.
//! Inside the bridge consumer they are logged and the event dropped, so
//! one bad worker event cannot crash shared dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Result, UnmaskingError};
use crate::event::events::{Event, SenderKind};

/// Receives events published on an [`EventBus`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors raised here propagate to an in-process
    /// publisher; for bridged worker events they are logged and the event
    /// is dropped.
    async fn handle(&self, name: &str, event: &Event, sender: SenderKind) -> Result<()>;
}

/// Shared cooperative cancellation flag.
///
/// Checked once per unmasking round and at bridge-scope boundaries;
/// setting it stops in-flight strategies at their next checkpoint.
/// Cancellation is cooperative, never preemptive.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct Subscription {
    senders: Option<Vec<SenderKind>>,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    fn matches(&self, sender: SenderKind) -> bool {
        match &self.senders {
            None => true,
            Some(allowed) => allowed.contains(&sender),
        }
    }
}

enum QueueItem {
    Publish {
        name: String,
        event: Event,
        sender: SenderKind,
    },
    /// Sentinel waking the consumer so its loop can exit.
    Shutdown,
}

struct BridgeState {
    tx: UnboundedSender<QueueItem>,
    rx: Mutex<Option<UnboundedReceiver<QueueItem>>>,
    active: AtomicBool,
    terminate: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl BridgeState {
    fn enqueue(&self, name: &str, event: Event, sender: SenderKind) {
        if self.terminate.load(Ordering::SeqCst) {
            // shutting down, don't accept new events from stragglers
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem::Publish {
            name: name.to_string(),
            event,
            sender,
        };
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
    }
}

/// Event bus with subscription-order delivery and a cross-worker bridge.
pub struct EventBus {
    controller: ThreadId,
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    bridge: BridgeState,
}

impl EventBus {
    /// Create a bus. The calling thread becomes the controller thread:
    /// only publishes from this thread dispatch directly, everything else
    /// is bridged.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            controller: thread::current().id(),
            subscribers: Mutex::new(HashMap::new()),
            bridge: BridgeState {
                tx,
                rx: Mutex::new(Some(rx)),
                active: AtomicBool::new(false),
                terminate: Arc::new(AtomicBool::new(false)),
                pending: Arc::new(AtomicUsize::new(0)),
                drained: Arc::new(Notify::new()),
            },
        }
    }

    /// Subscribe `handler` to events named `name`. With `senders` set,
    /// only events published by one of the listed sender types are
    /// delivered; `None` matches every sender.
    pub fn subscribe(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
        senders: Option<&[SenderKind]>,
    ) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(name.to_string()).or_default().push(Subscription {
            senders: senders.map(|s| s.to_vec()),
            handler,
        });
    }

    /// Remove a subscription previously registered with the same handler
    /// and sender filter.
    pub fn unsubscribe(
        &self,
        name: &str,
        handler: &Arc<dyn EventHandler>,
        senders: Option<&[SenderKind]>,
    ) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(name) {
            let senders = senders.map(|s| s.to_vec());
            list.retain(|s| !(Arc::ptr_eq(&s.handler, handler) && s.senders == senders));
        }
    }

    /// Publish an event.
    ///
    /// On the controller thread this dispatches synchronously (in
    /// subscription order, awaiting each handler); a handler error
    /// short-circuits and propagates to the caller. On any other thread
    /// the event is enqueued for redelivery by the bridge consumer, or
    /// silently dropped when the bridge is terminating.
    pub async fn publish(&self, name: &str, event: Event, sender: SenderKind) -> Result<()> {
        if thread::current().id() != self.controller {
            self.bridge.enqueue(name, event, sender);
            return Ok(());
        }
        self.dispatch(name, &event, sender).await
    }

    async fn dispatch(&self, name: &str, event: &Event, sender: SenderKind) -> Result<()> {
        // snapshot matching subscriptions so no lock is held across await
        let matching: Vec<Subscription> = {
            let subs = self.subscribers.lock().unwrap();
            match subs.get(name) {
                None => return Ok(()),
                Some(list) => list.iter().filter(|s| s.matches(sender)).cloned().collect(),
            }
        };
        for sub in matching {
            sub.handler.handle(name, event, sender).await?;
        }
        Ok(())
    }

    /// Cheap handle for publishing from worker-pool threads. Same
    /// semantics as an off-controller [`EventBus::publish`], callable
    /// from synchronous code.
    pub fn worker_publisher(&self) -> WorkerPublisher {
        WorkerPublisher {
            tx: self.bridge.tx.clone(),
            terminate: Arc::clone(&self.bridge.terminate),
            pending: Arc::clone(&self.bridge.pending),
            drained: Arc::clone(&self.bridge.drained),
        }
    }

    /// Stop accepting bridged events permanently (cooperative shutdown
    /// after a user interrupt). In-flight workers observe this through
    /// [`WorkerPublisher::terminated`].
    pub fn terminate(&self) {
        self.bridge.terminate.store(true, Ordering::SeqCst);
    }

    /// Open a bridge scope: clear the termination flag and start the
    /// queue consumer. Re-entering while a scope is already active is a
    /// no-op (the returned scope closes without effect).
    ///
    /// Must be called on the controller thread.
    pub fn open_bridge(self: &Arc<Self>) -> Result<BridgeScope> {
        if thread::current().id() != self.controller {
            return Err(UnmaskingError::Bus(
                "bridge scope must be opened on the controller thread".to_string(),
            ));
        }
        if self.bridge.active.swap(true, Ordering::SeqCst) {
            return Ok(BridgeScope {
                bus: Arc::clone(self),
                consumer: None,
            });
        }
        let rx = self.bridge.rx.lock().unwrap().take().ok_or_else(|| {
            self.bridge.active.store(false, Ordering::SeqCst);
            UnmaskingError::Bus("bridge consumer did not return its receiver".to_string())
        })?;
        self.bridge.terminate.store(false, Ordering::SeqCst);
        let consumer = tokio::spawn(consume(Arc::clone(self), rx));
        Ok(BridgeScope {
            bus: Arc::clone(self),
            consumer: Some(consumer),
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronous publish handle handed to worker-pool tasks.
#[derive(Clone)]
pub struct WorkerPublisher {
    tx: UnboundedSender<QueueItem>,
    terminate: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl WorkerPublisher {
    /// Enqueue an event for redelivery on the controller. Dropped
    /// silently when the bridge is terminating.
    pub fn publish(&self, name: &str, event: Event, sender: SenderKind) {
        if self.terminate.load(Ordering::SeqCst) {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem::Publish {
            name: name.to_string(),
            event,
            sender,
        };
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
    }

    /// Whether the bridge has been asked to terminate. Doubles as the
    /// strategy-side shutdown checkpoint once the owning scope exits.
    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}

/// Active bridge scope. Must be [`BridgeScope::close`]d so no late worker
/// event is lost; closing waits for the queue to drain fully, then sets
/// the termination flag and stops the consumer with a sentinel.
pub struct BridgeScope {
    bus: Arc<EventBus>,
    consumer: Option<JoinHandle<()>>,
}

impl BridgeScope {
    /// Drain remaining bridged events, then shut the consumer down.
    pub async fn close(mut self) -> Result<()> {
        let consumer = match self.consumer.take() {
            // nested scope: the outer scope owns the consumer
            None => return Ok(()),
            Some(c) => c,
        };

        // wait until every enqueued event has been re-dispatched
        loop {
            if self.bus.bridge.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            let notified = self.bus.bridge.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.bus.bridge.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        // refuse stragglers from here on, then wake the consumer loop
        self.bus.bridge.terminate.store(true, Ordering::SeqCst);
        let _ = self.bus.bridge.tx.send(QueueItem::Shutdown);
        consumer
            .await
            .map_err(|e| UnmaskingError::Task(format!("bridge consumer panicked: {}", e)))?;
        self.bus.bridge.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for BridgeScope {
    fn drop(&mut self) {
        // best effort if the scope was not closed explicitly
        if let Some(consumer) = self.consumer.take() {
            self.bus.bridge.terminate.store(true, Ordering::SeqCst);
            let _ = self.bus.bridge.tx.send(QueueItem::Shutdown);
            consumer.abort();
            self.bus.bridge.active.store(false, Ordering::SeqCst);
        }
    }
}

async fn consume(bus: Arc<EventBus>, mut rx: UnboundedReceiver<QueueItem>) {
    loop {
        let item = match rx.recv().await {
            Some(item) => item,
            None => break,
        };
        match item {
            QueueItem::Shutdown => break,
            QueueItem::Publish {
                name,
                event,
                sender,
            } => {
                let result = bus.dispatch(&name, &event, sender).await;
                bus.bridge.pending.fetch_sub(1, Ordering::SeqCst);
                bus.bridge.drained.notify_waiters();
                if let Err(err) = result {
                    warn!(
                        event_name = %name,
                        error = %err,
                        "dropping bridged event after handler failure"
                    );
                }
            }
        }
    }
    // hand the receiver back for the next bridge scope
    *bus.bridge.rx.lock().unwrap() = Some(rx);
}
