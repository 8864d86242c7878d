//! Synchronous, in-process publish/subscribe event bus.
//!
//! [`EventBus::notify`] calls every matching handler, in subscription order,
//! on the caller's thread before returning. There is no buffering, no replay
//! and no cross-process delivery.
//!
//! # Failure isolation
//!
//! A handler that returns `Err` is logged at `warn` level and counted in the
//! returned [`NotifyOutcome`]; delivery continues with the remaining
//! handlers. A handler that panics unwinds through `notify` like any other
//! panic in the caller.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use llmnav_middleware::EventBus;
//! use llmnav_types::EventType;
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! bus.subscribe(EventType::SimulationAborted, move |event| {
//!     sink.lock().unwrap().push(event.kind);
//!     Ok(())
//! });
//!
//! let outcome = bus.notify(EventType::SimulationAborted, serde_json::json!({ "reason": "test" }));
//! assert_eq!(outcome.delivered, 1);
//! assert_eq!(*seen.lock().unwrap(), vec![EventType::SimulationAborted]);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use llmnav_types::{Event, EventType, NavError};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Source tag stamped on events created by [`EventBus::notify`].
const DEFAULT_SOURCE: &str = "llmnav";

/// Callback invoked for every delivered event.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), NavError> + Send + Sync>;

/// Opaque handle returned by `subscribe*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// How a single `notify`/`publish` call went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err`.
    pub failed: usize,
}

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every event type.
    kind: Option<EventType>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Shared event bus. Clone it cheaply – all clones share the same
/// subscription list.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Subscription management
    // -----------------------------------------------------------------------

    /// Register `handler` for events of type `kind`.
    pub fn subscribe<F>(&self, kind: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), NavError> + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event type.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), NavError> + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Forward events into an unbounded Tokio channel so async code can
    /// consume them. `None` forwards every event type.
    ///
    /// Once the receiver is dropped the forwarding handler starts failing;
    /// unsubscribe it with the returned id.
    pub fn subscribe_channel(
        &self,
        kind: Option<EventType>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |event: &Event| {
            tx.send(event.clone())
                .map_err(|_| NavError::Handler("event channel receiver dropped".to_string()))
        });
        (self.insert(kind, handler), rx)
    }

    /// Remove a subscription. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != id);
        registry.subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscriptions.len()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Build an [`Event`] from `kind` and `payload` and deliver it.
    pub fn notify(&self, kind: EventType, payload: serde_json::Value) -> NotifyOutcome {
        self.publish(Event::new(DEFAULT_SOURCE, kind, payload))
    }

    /// Deliver a pre-built event to every matching handler, in subscription
    /// order.
    ///
    /// Handlers are snapshotted before dispatch, so a handler may itself
    /// call `notify`, `subscribe` or `unsubscribe` without deadlocking.
    pub fn publish(&self, event: Event) -> NotifyOutcome {
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .registry()
            .subscriptions
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == event.kind))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut outcome = NotifyOutcome::default();
        for (id, handler) in handlers {
            match handler(&event) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        subscription = id.0,
                        event = %event.kind,
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        }
        trace!(event = %event.kind, delivered = outcome.delivered, failed = outcome.failed, "event dispatched");
        outcome
    }

    fn insert(&self, kind: Option<EventType>, handler: Handler) -> SubscriptionId {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscriptions.push(Subscription { id, kind, handler });
        id
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
