//! Process-local publish/subscribe for lifecycle events.
//!
//! Each subscriber owns an unbounded delivery queue drained by a dedicated
//! worker task, so `publish` only enqueues and never blocks on subscriber
//! work. Delivery to a single subscriber preserves enqueue order; there is
//! no ordering guarantee between subscribers. A failing subscriber is
//! logged and never stops delivery to others. Re-entrant publish from a
//! subscriber callback is a plain enqueue, not recursion.

pub mod events;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub use events::{Event, EventKind, Observer};

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscription {
    name: String,
    /// `None` subscribes to every kind.
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// In-process event bus with per-subscriber worker delivery.
///
/// Subscribing spawns a worker task, so a tokio runtime must be current.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for the given kinds (`None` = all kinds).
    ///
    /// The observer is driven by its own worker task; events published from
    /// this point on are delivered in publish order.
    pub fn subscribe(
        &self,
        observer: Arc<dyn Observer>,
        kinds: Option<&[EventKind]>,
    ) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let name = observer.name().to_owned();

        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(error) = observer.on_event(&event).await {
                    tracing::warn!(
                        observer = %worker_name,
                        kind = %event.kind,
                        error = %error,
                        "observer failed to handle event"
                    );
                }
            }
        });

        let subscription = Subscription {
            name,
            kinds: kinds.map(|ks| ks.iter().copied().collect()),
            tx,
        };
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .insert(id, subscription);

        SubscriberId(id)
    }

    /// Remove a subscriber. Synchronous: the next `publish` will not
    /// enqueue to it. Events already queued still drain, then the worker
    /// exits.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .remove(&id.0)
            .is_some()
    }

    /// Enqueue an event to every interested subscriber and return. Never
    /// blocks on subscriber work.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        tracing::debug!(
            kind = %event.kind,
            source_id = %event.source_id,
            subscribers = subscribers.len(),
            "publishing event"
        );
        for subscription in subscribers.values() {
            if subscription.wants(event.kind) {
                // A closed receiver means the worker died; ignore, the
                // subscription is torn down on unsubscribe.
                if subscription.tx.send(event.clone()).is_err() {
                    tracing::warn!(
                        observer = %subscription.name,
                        "dropping event for closed subscriber queue"
                    );
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}
