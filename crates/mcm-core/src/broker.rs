//! Producer → consumer event fan-out with timeouts.
//!
//! A single broker thread drains an internal bounded channel and delivers
//! each event to every subscriber registered for the event's `consumer_id`,
//! within a per-delivery timeout. A delivery that doesn't land in time is
//! logged and dropped rather than blocking the broker thread indefinitely.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::channel::Channel;
use crate::context::{CancelFn, Context};

const QUEUE_CAPACITY: usize = 100;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Event kinds the core raises. `Custom` covers forward compatibility for
/// transport-specific events not named here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    ConnUnlinkRequested,
    ConnZeroCopyConfig,
    Custom(String),
}

#[derive(Clone, Debug)]
pub struct Event {
    pub consumer_id: String,
    pub kind: EventKind,
    pub params: Vec<(String, String)>,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registered {
    consumer_id: String,
    handler: Subscriber,
}

/// Producer-facing handle; cloneable, forwards onto the broker's internal
/// channel.
#[derive(Clone)]
pub struct EventBroker {
    queue: Arc<Channel<Event>>,
    subscribers: Arc<Mutex<Vec<Registered>>>,
}

/// Owns the broker's worker thread; dropping it does not stop the thread —
/// call `shutdown` explicitly, matching this crate's synchronous shutdown
/// convention for long-running workers.
pub struct EventBrokerHandle {
    broker: EventBroker,
    ctx: Context,
    cancel: CancelFn,
    worker: Option<JoinHandle<()>>,
}

impl EventBroker {
    /// Spawns the broker thread and returns a handle plus the producer-
    /// facing broker for subscription/send.
    pub fn spawn() -> EventBrokerHandle {
        let (ctx, cancel) = Context::background().with_cancel();
        let broker = EventBroker {
            queue: Arc::new(Channel::new(QUEUE_CAPACITY)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        };

        let worker_broker = broker.clone();
        let worker_ctx = ctx.clone();
        let worker = thread::Builder::new()
            .name("mcm-event-broker".into())
            .spawn(move || worker_broker.run(&worker_ctx))
            .expect("spawn event broker thread");

        EventBrokerHandle {
            broker,
            ctx,
            cancel,
            worker: Some(worker),
        }
    }

    /// Registers a handler invoked for every event whose `consumer_id`
    /// matches. Returns no token: callers aren't expected to unsubscribe,
    /// only best-effort delivery while the consumer is alive.
    pub fn subscribe(&self, consumer_id: impl Into<String>, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Registered {
            consumer_id: consumer_id.into(),
            handler: Arc::new(handler),
        });
    }

    /// Enqueues an event for delivery. Blocks (briefly) if the internal
    /// queue is full; never blocks past `ctx`'s cancellation.
    pub fn send(&self, ctx: &Context, consumer_id: impl Into<String>, kind: EventKind, params: Vec<(String, String)>) -> bool {
        self.queue.send(
            ctx,
            Event {
                consumer_id: consumer_id.into(),
                kind,
                params,
            },
        )
    }

    fn run(&self, ctx: &Context) {
        loop {
            if ctx.cancelled() {
                return;
            }
            let Some(event) = self.queue.receive(ctx) else {
                if ctx.cancelled() {
                    return;
                }
                continue;
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &Event) {
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter().filter(|s| s.consumer_id == event.consumer_id) {
            let delivered = deliver_with_timeout(sub.handler.clone(), event.clone(), DELIVERY_TIMEOUT);
            if !delivered {
                tracing::warn!(
                    consumer_id = %event.consumer_id,
                    kind = ?event.kind,
                    "event delivery timed out, dropping"
                );
            }
        }
    }
}

/// Runs `handler(&event)` on its own detached thread and waits up to
/// `timeout` for it to finish. A handler that blocks past the deadline is
/// abandoned — its thread keeps running on its own — so the broker's
/// delivery loop never stalls on a misbehaving subscriber.
fn deliver_with_timeout(handler: Subscriber, event: Event, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new().name("mcm-event-delivery".into()).spawn(move || {
        handler(&event);
        let _ = tx.send(());
    });
    if spawned.is_err() {
        return false;
    }
    rx.recv_timeout(timeout).is_ok()
}

impl EventBrokerHandle {
    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    /// Cancels the broker thread and joins it. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.broker.queue.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventBrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_only_to_matching_consumer() {
        let mut handle = EventBroker::spawn();
        let broker = handle.broker().clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        broker.subscribe("conn-a", move |_evt| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = Context::background();
        assert!(broker.send(&ctx, "conn-b", EventKind::ConnUnlinkRequested, vec![]));
        assert!(broker.send(&ctx, "conn-a", EventKind::ConnUnlinkRequested, vec![]));

        // give the broker thread a moment to drain
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[test]
    fn deliver_with_timeout_drops_a_blocking_handler_instead_of_hanging() {
        let handler: Subscriber = Arc::new(|_evt: &Event| {
            std::thread::sleep(Duration::from_secs(10));
        });
        let event = Event {
            consumer_id: "conn-a".into(),
            kind: EventKind::Custom("slow".into()),
            params: vec![],
        };
        let delivered = deliver_with_timeout(handler, event, Duration::from_millis(50));
        assert!(!delivered);
    }
}
