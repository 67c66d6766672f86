//! In-process subscriber registry (fan-out mechanics only).
//!
//! The registry knows nothing about storage: the emitting bus in `opsync-infra`
//! appends an event durably first and then hands it to [`SubscriberRegistry::dispatch`].
//!
//! Dispatch guarantees:
//! - handlers run synchronously, in registration order
//! - dispatch iterates over a snapshot of the handler set, so handlers may
//!   subscribe or unsubscribe (even themselves) while being called
//! - a handler that returns an error or panics is logged and counted; the
//!   remaining handlers still run and the caller never sees the failure

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::event::Event;
use crate::payload::EventType;

/// Failure reported by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type HandlerFn = dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync;

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Type(EventType),
    Many(HashSet<EventType>),
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Type(t) => *t == event_type,
            EventFilter::Many(set) => set.contains(&event_type),
        }
    }
}

struct Entry {
    id: u64,
    filter: EventFilter,
    handler: Arc<HandlerFn>,
}

struct Waiter {
    event_type: EventType,
    tx: oneshot::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    // Handlers never run under this lock, so a poisoned guard still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counters describing the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub handlers: usize,
    pub pending_once: usize,
    pub delivered: u64,
    pub failed: u64,
}

/// Result of dispatching one event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Handle returned by every registration.
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<SharedHandle>,
}

// Indirection so `Subscription` can be `Debug` without exposing internals.
struct SharedHandle(Shared);

impl core::fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriberRegistry").finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(shared) = self.registry.upgrade() else {
            return false;
        };
        let mut inner = shared.0.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != self.id);
        before != inner.entries.len()
    }
}

/// Registry of event handlers; cheap to clone.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    shared: Arc<SharedHandle>,
}

impl Default for SharedHandle {
    fn default() -> Self {
        SharedHandle(Shared::default())
    }
}

impl core::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, filter: EventFilter, handler: Arc<HandlerFn>) -> Subscription {
        let mut inner = self.shared.0.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Entry { id, filter, handler });
        Subscription {
            id,
            registry: Arc::downgrade(&self.shared),
        }
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(EventFilter::Type(event_type), Arc::new(handler))
    }

    /// Subscribe to every event.
    pub fn on_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(EventFilter::All, Arc::new(handler))
    }

    /// Subscribe to a set of event types.
    pub fn on_many<F>(&self, event_types: impl IntoIterator<Item = EventType>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let set: HashSet<EventType> = event_types.into_iter().collect();
        self.register(EventFilter::Many(set), Arc::new(handler))
    }

    /// Resolve on the next dispatched event of `event_type`.
    ///
    /// The receiver errors if the registry is dropped first. Waiters whose
    /// receiver was dropped are discarded on the next registration.
    pub fn once(&self, event_type: EventType) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.0.lock();
        inner.waiters.retain(|w| !w.tx.is_closed());
        inner.waiters.push(Waiter { event_type, tx });
        rx
    }

    /// Deliver `event` to every matching handler and pending `once` waiter.
    pub fn dispatch(&self, event: &Event) -> DispatchOutcome {
        let (handlers, waiters) = {
            let mut inner = self.shared.0.lock();
            let handlers: Vec<(u64, Arc<HandlerFn>)> = inner
                .entries
                .iter()
                .filter(|e| e.filter.matches(event.event_type))
                .map(|e| (e.id, Arc::clone(&e.handler)))
                .collect();
            let (ready, keep): (Vec<Waiter>, Vec<Waiter>) = inner
                .waiters
                .drain(..)
                .partition(|w| w.event_type == event.event_type);
            inner.waiters = keep;
            (handlers, ready)
        };

        let mut outcome = DispatchOutcome::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(err)) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        subscription = id,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    outcome.failed += 1;
                    tracing::error!(
                        subscription = id,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "event handler panicked"
                    );
                }
            }
        }

        for waiter in waiters {
            // Receiver may have been dropped; nothing to do then.
            let _ = waiter.tx.send(event.clone());
        }

        let shared = &self.shared.0;
        shared.delivered.fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        shared.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        outcome
    }

    pub fn stats(&self) -> RegistryStats {
        let shared = &self.shared.0;
        let inner = shared.lock();
        RegistryStats {
            handlers: inner.entries.len(),
            pending_once: inner.waiters.len(),
            delivered: shared.delivered.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::payload::{CounterIncremented, EventPayload, RegisterSet, RegisterValue};
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp};
    use std::sync::atomic::AtomicUsize;

    fn event(payload: EventPayload) -> Event {
        Event::new(
            EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new()),
            Stamp::default(),
            payload,
        )
    }

    fn increment() -> Event {
        event(EventPayload::CounterIncremented(CounterIncremented {
            key: "k".to_string(),
            amount: 1,
        }))
    }

    fn set() -> Event {
        event(EventPayload::RegisterSet(RegisterSet {
            key: "k".to_string(),
            value: RegisterValue::Int(1),
        }))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_: &Event| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn routes_by_filter() {
        let registry = SubscriberRegistry::new();
        let (typed, typed_handler) = counter();
        let (all, all_handler) = counter();
        let (many, many_handler) = counter();
        registry.on(EventType::CounterIncremented, typed_handler);
        registry.on_all(all_handler);
        registry.on_many([EventType::RegisterSet, EventType::PersonAssigned], many_handler);

        registry.dispatch(&increment());
        registry.dispatch(&set());

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(many.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let (hits, handler) = counter();
        let sub = registry.on_all(handler);

        registry.dispatch(&increment());
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        registry.dispatch(&increment());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().handlers, 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_the_others() {
        let registry = SubscriberRegistry::new();
        registry.on_all(|_| Err(HandlerError::new("boom")));
        registry.on_all(|_| panic!("handler bug"));
        let (hits, handler) = counter();
        registry.on_all(handler);

        let outcome = registry.dispatch(&increment());

        assert_eq!(outcome, DispatchOutcome { delivered: 1, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = registry.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let registry = SubscriberRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let sub = registry.on_all(move |_| {
            if let Some(sub) = inner_slot.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(registry.dispatch(&increment()).delivered, 1);
        assert_eq!(registry.dispatch(&increment()).delivered, 0);
    }

    #[tokio::test]
    async fn once_resolves_on_next_matching_event() {
        let registry = SubscriberRegistry::new();
        let rx = registry.once(EventType::RegisterSet);

        registry.dispatch(&increment());
        assert_eq!(registry.stats().pending_once, 1);

        let ev = set();
        registry.dispatch(&ev);
        assert_eq!(rx.await.unwrap().id, ev.id);
        assert_eq!(registry.stats().pending_once, 0);
    }

    #[test]
    fn abandoned_once_waiters_are_discarded() {
        let registry = SubscriberRegistry::new();
        for _ in 0..3 {
            drop(registry.once(EventType::RegisterSet));
        }
        let _rx = registry.once(EventType::RegisterSet);
        assert_eq!(registry.stats().pending_once, 1);
    }
}
