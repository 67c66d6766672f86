//! The emitting event bus.
//!
//! Turns "something happened" into a durable, sealed event plus synchronous
//! fan-out. Ordering invariant: **subscribers are notified only after the
//! append succeeded**. A failed append is returned to the caller and nobody
//! is notified.
//!
//! Emits through one bus (and its clones) are serialized from stamping to
//! append, so each device's hash chain stays linear.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

use opsync_core::{DeviceClock, EventId, OperationId, Timestamp};
use opsync_events::{
    ChainError, DispatchOutcome, Event, EventMetadata, EventPayload, EventType, HandlerError, RegistryStats,
    SubscriberRegistry, Subscription, ValidationError, integrity,
};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("integrity: {0}")]
    Integrity(#[from] ChainError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BusStats {
    pub emitted: u64,
    pub rejected: u64,
    pub remote_applied: u64,
    pub replayed: u64,
    pub registry: RegistryStats,
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    rejected: AtomicU64,
    remote_applied: AtomicU64,
    replayed: AtomicU64,
}

/// Durable emit + in-process fan-out for one replica.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn EventStore>,
    registry: SubscriberRegistry,
    clock: Arc<DeviceClock>,
    counters: Arc<Counters>,
    emit_lock: Arc<Mutex<()>>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("registry", &self.registry)
            .field("clock", &self.clock.last())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_clock(store, Arc::new(DeviceClock::new()))
    }

    pub fn with_clock(store: Arc<dyn EventStore>, clock: Arc<DeviceClock>) -> Self {
        Self {
            store,
            registry: SubscriberRegistry::new(),
            clock,
            counters: Arc::new(Counters::default()),
            emit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<DeviceClock> {
        &self.clock
    }

    /// Validate, stamp, seal, append, then notify. Returns the new event id.
    pub async fn emit(&self, payload: EventPayload, metadata: EventMetadata) -> Result<EventId, BusError> {
        Ok(self.emit_event(payload, metadata).await?.id)
    }

    /// Like [`EventBus::emit`] but returns the full stored event.
    pub async fn emit_event(&self, payload: EventPayload, metadata: EventMetadata) -> Result<Event, BusError> {
        self.emit_with_wall_clock(payload, metadata, Timestamp::now()).await
    }

    /// Emit using an explicit wall-clock reading (imports, deterministic tests).
    ///
    /// The device clock still guarantees the stamp is later than anything
    /// this replica emitted or observed before.
    pub async fn emit_with_wall_clock(
        &self,
        payload: EventPayload,
        metadata: EventMetadata,
        wall: Timestamp,
    ) -> Result<Event, BusError> {
        if let Err(err) = payload.validate() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(event_type = %payload.event_type(), error = %err, "rejected event");
            return Err(err.into());
        }

        let stored = {
            let _chain = self.emit_lock.lock().await;
            let stamp = self.clock.tick_at(wall);
            let mut event = Event::new(metadata, stamp, payload);
            let previous = self.store.chain_head(event.device_id).await?;
            integrity::seal(&mut event, previous)?;
            self.store.append(event).await?
        };
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            event_id = %stored.event.id,
            event_type = %stored.event.event_type,
            position = stored.position,
            "event appended"
        );

        self.registry.dispatch(&stored.event);
        Ok(stored.event)
    }

    /// Record an event received from the remote peer and notify subscribers.
    ///
    /// Idempotent: an already stored event is neither stored nor dispatched
    /// again (`Ok(None)`). The device clock advances past the event's stamp so
    /// events emitted in reaction to it sort after it.
    pub async fn apply_remote(&self, event: Event) -> Result<Option<StoredEvent>, BusError> {
        if event.hash.is_some() {
            integrity::verify(&event)?;
        }
        self.clock.observe(event.stamp());
        let Some(stored) = self.store.record_remote(event).await? else {
            return Ok(None);
        };
        self.counters.remote_applied.fetch_add(1, Ordering::Relaxed);
        self.registry.dispatch(&stored.event);
        Ok(Some(stored))
    }

    /// Re-deliver stored events to every current subscriber.
    pub async fn replay(&self, operation: Option<OperationId>, since: Option<Timestamp>) -> Result<usize, BusError> {
        let events = self.store.query(operation, since).await?;
        for stored in &events {
            self.registry.dispatch(&stored.event);
        }
        self.counters.replayed.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events.len())
    }

    /// Re-deliver stored events to one handler only (late joiners).
    ///
    /// Handler failures are logged and counted; they never stop the replay.
    pub async fn replay_to<F>(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
        mut handler: F,
    ) -> Result<DispatchOutcome, BusError>
    where
        F: FnMut(&Event) -> Result<(), HandlerError>,
    {
        let events = self.store.query(operation, since).await?;
        let mut outcome = DispatchOutcome::default();
        for stored in &events {
            match handler(&stored.event) {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    outcome.failed += 1;
                    tracing::warn!(event_id = %stored.event.id, error = %err, "replay handler failed");
                }
            }
        }
        self.counters.replayed.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    pub fn on<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.on(event_type, handler)
    }

    pub fn on_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.on_all(handler)
    }

    pub fn on_many<F>(&self, event_types: impl IntoIterator<Item = EventType>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.on_many(event_types, handler)
    }

    pub fn once(&self, event_type: EventType) -> oneshot::Receiver<Event> {
        self.registry.once(event_type)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            remote_applied: self.counters.remote_applied.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            registry: self.registry.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryEventStore, OutboxStatus};
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp};
    use opsync_events::{CounterIncremented, verify_chain};
    use std::sync::Mutex;

    fn metadata(device: DeviceId) -> EventMetadata {
        EventMetadata::new(ActorId::new(), device, SessionId::new())
    }

    fn increment(amount: i64) -> EventPayload {
        EventPayload::CounterIncremented(CounterIncremented {
            key: "meals".to_string(),
            amount,
        })
    }

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryEventStore::new()))
    }

    #[tokio::test]
    async fn emit_appends_enqueues_and_notifies() {
        let bus = bus();
        let seen: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(EventType::CounterIncremented, move |ev| {
            sink.lock().unwrap().push(ev.id);
            Ok(())
        });

        let id = bus.emit(increment(5), metadata(DeviceId::new())).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![id]);
        let stored = bus.store().get(id).await.unwrap().unwrap();
        assert!(stored.event.hash.is_some());
        let item = bus.store().outbox_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_payloads_never_reach_the_store() {
        let bus = bus();
        let err = bus.emit(increment(0), metadata(DeviceId::new())).await.unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
        assert_eq!(bus.store().stats().await.unwrap().events, 0);
        assert_eq!(bus.stats().rejected, 1);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_fail_emit() {
        let bus = bus();
        bus.on_all(|_| Err(HandlerError::new("projection offline")));
        assert!(bus.emit(increment(1), metadata(DeviceId::new())).await.is_ok());
        assert_eq!(bus.stats().registry.failed, 1);
    }

    #[tokio::test]
    async fn emitted_events_form_a_chain_per_device() {
        let bus = bus();
        let device = DeviceId::new();
        for amount in 1..=3 {
            bus.emit(increment(amount), metadata(device)).await.unwrap();
        }
        let events: Vec<Event> = bus
            .store()
            .query(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.event)
            .collect();
        assert!(verify_chain(&events).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_emits_keep_the_chain_linear() {
        let bus = bus();
        let device = DeviceId::new();
        let tasks: Vec<_> = (1..=32)
            .map(|amount| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.emit(increment(amount), metadata(device)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let events: Vec<Event> = bus
            .store()
            .query(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.event)
            .collect();
        assert_eq!(events.len(), 32);
        assert!(verify_chain(&events).is_ok());
        let roots = events.iter().filter(|e| e.previous_hash.is_none()).count();
        assert_eq!(roots, 1);
    }

    #[tokio::test]
    async fn remote_events_are_applied_once_and_advance_the_clock() {
        let bus = bus();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        bus.on_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let remote = Event::new(
            metadata(DeviceId::new()),
            Stamp::new(Timestamp::from_millis(u64::MAX / 2), 7),
            increment(2),
        );
        assert!(bus.apply_remote(remote.clone()).await.unwrap().is_some());
        assert!(bus.apply_remote(remote.clone()).await.unwrap().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let next = bus.emit_event(increment(1), metadata(DeviceId::new())).await.unwrap();
        assert!(next.stamp() > remote.stamp());
        assert!(bus.store().outbox_item(remote.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_remote_events_are_rejected() {
        let bus = bus();
        let mut remote = Event::new(metadata(DeviceId::new()), Stamp::default(), increment(2));
        integrity::seal(&mut remote, None).unwrap();
        remote.payload = increment(200);

        let err = bus.apply_remote(remote).await.unwrap_err();
        assert!(matches!(err, BusError::Integrity(_)));
    }

    #[tokio::test]
    async fn replay_redelivers_history() {
        let bus = bus();
        bus.emit(increment(1), metadata(DeviceId::new())).await.unwrap();
        bus.emit(increment(2), metadata(DeviceId::new())).await.unwrap();

        let mut total = 0;
        let outcome = bus
            .replay_to(None, None, |ev| {
                if let EventPayload::CounterIncremented(p) = &ev.payload {
                    total += p.amount;
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(total, 3);

        let rx = bus.once(EventType::CounterIncremented);
        assert_eq!(bus.replay(None, None).await.unwrap(), 2);
        assert!(rx.await.is_ok());
    }
}
