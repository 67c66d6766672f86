//! Projection manager.
//!
//! Holds named projection runners for one operation scope (or all events),
//! folds events as they are emitted, rebuilds from snapshots and writes
//! checkpoints back to the event store.
//!
//! Snapshot positions refer to the store's append order, not to timestamps:
//! a remote event recorded after a snapshot always has a greater position even
//! when its timestamp is older, so "snapshot + everything after its position"
//! covers exactly the events the snapshot has not seen.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use opsync_core::{OperationId, Timestamp};
use opsync_events::{
    Applied, Checkpoint, Event, HandlerError, Projection, ProjectionError, ProjectionRunner, SubscriberRegistry,
    Subscription,
};

use super::{
    ConflictsProjection, CountersProjection, CountyStatusProjection, DocumentsProjection, RegistersProjection,
    RosterProjection,
};
use crate::event_store::{EventStore, EventStoreError, Snapshot, StoredEvent};

/// Object-safe view of a `ProjectionRunner<P>`.
trait ErasedRunner: Send + Sync {
    fn offer(&mut self, event: &Event) -> Result<Applied, ProjectionError>;
    fn state_json(&self) -> Result<Value, ProjectionError>;
    fn checkpoint_json(&self) -> Result<Value, ProjectionError>;
    fn restore_json(&mut self, checkpoint: Value) -> Result<(), ProjectionError>;
    fn clear(&mut self);
    fn as_any(&self) -> &dyn Any;
}

impl<P> ErasedRunner for ProjectionRunner<P>
where
    P: Projection,
{
    fn offer(&mut self, event: &Event) -> Result<Applied, ProjectionError> {
        self.apply(event)
    }

    fn state_json(&self) -> Result<Value, ProjectionError> {
        serde_json::to_value(self.state()).map_err(|e| ProjectionError::Encoding {
            name: self.projection().name().to_string(),
            message: e.to_string(),
        })
    }

    fn checkpoint_json(&self) -> Result<Value, ProjectionError> {
        serde_json::to_value(self.checkpoint()).map_err(|e| ProjectionError::Encoding {
            name: self.projection().name().to_string(),
            message: e.to_string(),
        })
    }

    fn restore_json(&mut self, checkpoint: Value) -> Result<(), ProjectionError> {
        let checkpoint: Checkpoint<P::State> =
            serde_json::from_value(checkpoint).map_err(|e| ProjectionError::Snapshot {
                name: self.projection().name().to_string(),
                reason: e.to_string(),
            })?;
        self.restore(checkpoint);
        Ok(())
    }

    fn clear(&mut self) {
        self.reset();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Slot {
    runner: Box<dyn ErasedRunner>,
    /// Every event at or below this store position has been offered.
    caught_up_to: u64,
    listeners: Vec<(u64, Listener)>,
}

impl Slot {
    fn replay(&mut self, events: &[StoredEvent], operation: Option<OperationId>) -> Result<usize, ProjectionError> {
        let mut folded = 0;
        for stored in events {
            if stored.event.in_operation(operation) && self.runner.offer(&stored.event)? == Applied::Folded {
                folded += 1;
            }
        }
        Ok(folded)
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

#[derive(Default)]
struct Inner {
    slots: BTreeMap<&'static str, Slot>,
    next_listener: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn store_error(name: &str) -> impl FnOnce(EventStoreError) -> ProjectionError + '_ {
    move |err| ProjectionError::Store {
        name: name.to_string(),
        message: err.to_string(),
    }
}

/// Pending listener calls, made after the manager lock is released.
type Notifications = Vec<(&'static str, Value, Vec<Listener>)>;

fn notify(notifications: Notifications) {
    for (name, state, listeners) in notifications {
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&state))).is_err() {
                tracing::error!(projection = name, "projection listener panicked");
            }
        }
    }
}

/// Handle returned by [`ProjectionManager::subscribe`].
#[derive(Debug, Clone)]
pub struct ProjectionSubscription {
    projection: &'static str,
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl ProjectionSubscription {
    pub fn projection(&self) -> &'static str {
        self.projection
    }

    /// Returns `false` if already removed or the manager is gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut inner = lock(&inner);
        let Some(slot) = inner.slots.get_mut(self.projection) else {
            return false;
        };
        let before = slot.listeners.len();
        slot.listeners.retain(|(id, _)| *id != self.id);
        slot.listeners.len() != before
    }
}

/// What a rebuild did for one projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildSummary {
    pub projection: &'static str,
    /// Position of the snapshot restored, if one was usable.
    pub snapshot_position: Option<u64>,
    /// Events read from the store after the starting point.
    pub replayed: usize,
}

/// Named read models for one replica.
pub struct ProjectionManager {
    store: Arc<dyn EventStore>,
    operation: Option<OperationId>,
    inner: Arc<Mutex<Inner>>,
}

impl core::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("operation", &self.operation)
            .field("projections", &self.names())
            .finish_non_exhaustive()
    }
}

impl ProjectionManager {
    /// An empty manager. `operation` scopes both the events folded and the
    /// snapshots read and written; `None` follows every event.
    pub fn new(store: Arc<dyn EventStore>, operation: Option<OperationId>) -> Self {
        Self {
            store,
            operation,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// A manager with the built-in projections registered.
    pub fn with_defaults(store: Arc<dyn EventStore>, operation: Option<OperationId>) -> Self {
        let manager = Self::new(store, operation);
        {
            let mut inner = lock(&manager.inner);
            insert(&mut inner, CountersProjection);
            insert(&mut inner, RegistersProjection);
            insert(&mut inner, RosterProjection);
            insert(&mut inner, DocumentsProjection);
            insert(&mut inner, ConflictsProjection);
            insert(&mut inner, CountyStatusProjection);
        }
        manager
    }

    pub fn operation(&self) -> Option<OperationId> {
        self.operation
    }

    pub fn register<P>(&self, projection: P) -> Result<(), ProjectionError>
    where
        P: Projection,
    {
        let mut inner = lock(&self.inner);
        if inner.slots.contains_key(projection.name()) {
            return Err(ProjectionError::AlreadyRegistered(projection.name().to_string()));
        }
        insert(&mut inner, projection);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.inner).slots.keys().copied().collect()
    }

    /// Fold one event into every projection that handles its type.
    ///
    /// Events outside the manager's operation are skipped. Returns how many
    /// projections changed.
    pub fn apply(&self, event: &Event) -> Result<usize, ProjectionError> {
        if !event.in_operation(self.operation) {
            return Ok(0);
        }
        let mut folded = 0;
        let mut notifications = Notifications::new();
        {
            let mut inner = lock(&self.inner);
            for (name, slot) in inner.slots.iter_mut() {
                if slot.runner.offer(event)? != Applied::Folded {
                    continue;
                }
                folded += 1;
                if !slot.listeners.is_empty() {
                    notifications.push((*name, slot.runner.state_json()?, slot.listeners()));
                }
            }
        }
        notify(notifications);
        Ok(folded)
    }

    /// Keep the manager current with everything dispatched through `registry`.
    ///
    /// The handler holds a weak reference; dropping the manager turns it into
    /// a no-op.
    pub fn attach(self: &Arc<Self>, registry: &SubscriberRegistry) -> Subscription {
        let manager = Arc::downgrade(self);
        registry.on_all(move |event| {
            let Some(manager) = manager.upgrade() else {
                return Ok(());
            };
            manager
                .apply(event)
                .map(|_| ())
                .map_err(|err| HandlerError::new(err.to_string()))
        })
    }

    /// Current state of a projection as JSON.
    pub fn get_projection(&self, name: &str) -> Result<Value, ProjectionError> {
        let inner = lock(&self.inner);
        let slot = inner
            .slots
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))?;
        slot.runner.state_json()
    }

    /// Current state of a projection, typed.
    pub fn state<P>(&self, name: &str) -> Result<P::State, ProjectionError>
    where
        P: Projection,
    {
        let inner = lock(&self.inner);
        let slot = inner
            .slots
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))?;
        slot.runner
            .as_any()
            .downcast_ref::<ProjectionRunner<P>>()
            .map(|runner| runner.state().clone())
            .ok_or_else(|| ProjectionError::StateType { name: name.to_string() })
    }

    /// Call `listener` with the new state whenever the projection changes.
    ///
    /// Listeners run after the change is committed, outside the manager's
    /// lock; a panicking listener is logged and does not affect the others.
    pub fn subscribe<F>(&self, name: &str, listener: F) -> Result<ProjectionSubscription, ProjectionError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let projection = self.resolve(name)?;
        let mut inner = lock(&self.inner);
        inner.next_listener += 1;
        let id = inner.next_listener;
        slot_mut(&mut inner, projection)?.listeners.push((id, Arc::new(listener)));
        Ok(ProjectionSubscription {
            projection,
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Rebuild every projection; see [`ProjectionManager::rebuild_projection`].
    pub async fn rebuild(&self, since: Option<Timestamp>) -> Result<Vec<RebuildSummary>, ProjectionError> {
        let mut summaries = Vec::new();
        for name in self.names() {
            summaries.push(self.rebuild_projection(name, since).await?);
        }
        Ok(summaries)
    }

    /// Rebuild one projection from its latest snapshot plus the events stored
    /// after it, or from the full log.
    ///
    /// A snapshot is ignored (full replay) when it was taken before `since`,
    /// when its digest does not verify, or when its state no longer decodes.
    pub async fn rebuild_projection(
        &self,
        name: &str,
        since: Option<Timestamp>,
    ) -> Result<RebuildSummary, ProjectionError> {
        let name = self.resolve(name)?;
        let head = self.store.head_position().await.map_err(store_error(name))?;

        if let Some(snapshot) = self.usable_snapshot(name, since).await? {
            let position = snapshot.position;
            let tail = self
                .store
                .after_position(self.operation, position)
                .await
                .map_err(store_error(name))?;

            let restored = {
                let mut inner = lock(&self.inner);
                let slot = slot_mut(&mut inner, name)?;
                slot.runner.clear();
                match slot.runner.restore_json(snapshot.state) {
                    Ok(()) => {
                        slot.replay(&tail, self.operation)?;
                        slot.caught_up_to = head;
                        true
                    }
                    Err(err) => {
                        tracing::warn!(projection = name, error = %err, "snapshot unusable, replaying full log");
                        slot.runner.clear();
                        false
                    }
                }
            };
            if restored {
                tracing::info!(projection = name, position, replayed = tail.len(), "projection rebuilt from snapshot");
                self.notify_current(name)?;
                return Ok(RebuildSummary {
                    projection: name,
                    snapshot_position: Some(position),
                    replayed: tail.len(),
                });
            }
        }

        let events = self.store.query(self.operation, None).await.map_err(store_error(name))?;
        {
            let mut inner = lock(&self.inner);
            let slot = slot_mut(&mut inner, name)?;
            slot.runner.clear();
            slot.replay(&events, self.operation)?;
            slot.caught_up_to = head;
        }
        tracing::info!(projection = name, replayed = events.len(), "projection rebuilt from full log");
        self.notify_current(name)?;
        Ok(RebuildSummary {
            projection: name,
            snapshot_position: None,
            replayed: events.len(),
        })
    }

    /// Checkpoint every projection into the store.
    pub async fn snapshot(&self) -> Result<Vec<Snapshot>, ProjectionError> {
        let mut snapshots = Vec::new();
        for name in self.names() {
            snapshots.push(self.snapshot_projection(name).await?);
        }
        Ok(snapshots)
    }

    /// Checkpoint one projection.
    ///
    /// Before the checkpoint is taken the projection catches up on every
    /// stored event it has not been offered, so the snapshot's position is
    /// exact even for events that were stored without being dispatched.
    pub async fn snapshot_projection(&self, name: &str) -> Result<Snapshot, ProjectionError> {
        let name = self.resolve(name)?;
        let head = self.store.head_position().await.map_err(store_error(name))?;
        let caught_up_to = {
            let mut inner = lock(&self.inner);
            slot_mut(&mut inner, name)?.caught_up_to
        };
        let tail = self
            .store
            .after_position(self.operation, caught_up_to)
            .await
            .map_err(store_error(name))?;

        let (checkpoint, folded) = {
            let mut inner = lock(&self.inner);
            let slot = slot_mut(&mut inner, name)?;
            let folded = slot.replay(&tail, self.operation)?;
            slot.caught_up_to = slot.caught_up_to.max(head);
            (slot.runner.checkpoint_json()?, folded)
        };
        if folded > 0 {
            self.notify_current(name)?;
        }

        let snapshot = Snapshot::new(name, self.operation, head, Timestamp::now(), checkpoint);
        self.store
            .save_snapshot(snapshot.clone())
            .await
            .map_err(store_error(name))?;
        tracing::info!(projection = name, position = head, caught_up = folded, "projection snapshot saved");
        Ok(snapshot)
    }

    fn resolve(&self, name: &str) -> Result<&'static str, ProjectionError> {
        lock(&self.inner)
            .slots
            .keys()
            .copied()
            .find(|n| *n == name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
    }

    async fn usable_snapshot(&self, name: &'static str, since: Option<Timestamp>) -> Result<Option<Snapshot>, ProjectionError> {
        let Some(snapshot) = self
            .store
            .latest_snapshot(name, self.operation)
            .await
            .map_err(store_error(name))?
        else {
            return Ok(None);
        };
        if since.is_some_and(|since| snapshot.taken_at < since) {
            tracing::debug!(projection = name, taken_at = %snapshot.taken_at, "snapshot older than requested, ignoring");
            return Ok(None);
        }
        if !snapshot.verify() {
            tracing::warn!(projection = name, position = snapshot.position, "snapshot digest mismatch, replaying full log");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    fn notify_current(&self, name: &'static str) -> Result<(), ProjectionError> {
        let notification = {
            let mut inner = lock(&self.inner);
            let slot = slot_mut(&mut inner, name)?;
            if slot.listeners.is_empty() {
                return Ok(());
            }
            (name, slot.runner.state_json()?, slot.listeners())
        };
        notify(vec![notification]);
        Ok(())
    }
}

fn insert<P>(inner: &mut Inner, projection: P)
where
    P: Projection,
{
    let name = projection.name();
    inner.slots.insert(
        name,
        Slot {
            runner: Box::new(ProjectionRunner::new(projection)),
            caught_up_to: 0,
            listeners: Vec::new(),
        },
    );
}

fn slot_mut<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut Slot, ProjectionError> {
    inner
        .slots
        .get_mut(name)
        .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::event_bus::EventBus;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::RegisterEntry;
    use crate::projections::test_support::{counter, register};
    use opsync_core::{ActorId, DeviceId, SessionId};
    use opsync_events::{CounterIncremented, EventMetadata, EventPayload, RegisterValue};
    use proptest::prelude::*;

    fn setup() -> (Arc<InMemoryEventStore>, ProjectionManager) {
        let store = Arc::new(InMemoryEventStore::new());
        let manager = ProjectionManager::with_defaults(store.clone(), None);
        (store, manager)
    }

    fn counters(manager: &ProjectionManager) -> BTreeMap<String, i64> {
        manager.state::<CountersProjection>(CountersProjection::NAME).unwrap()
    }

    #[test]
    fn defaults_are_registered_once() {
        let (_, manager) = setup();
        assert_eq!(
            manager.names(),
            vec!["conflicts", "counters", "county_status", "documents", "registers", "roster"]
        );
        assert!(matches!(
            manager.register(CountersProjection),
            Err(ProjectionError::AlreadyRegistered(name)) if name == "counters"
        ));
    }

    #[test]
    fn apply_folds_into_handling_projections_only() {
        let (_, manager) = setup();
        assert_eq!(manager.apply(&counter("K", 5, 10)).unwrap(), 1);
        assert_eq!(manager.apply(&counter("K", 5, 10)).unwrap(), 1);
        assert_eq!(counters(&manager)["K"], 10);

        let json = manager.get_projection("counters").unwrap();
        assert_eq!(json["K"], 10);
        assert!(manager.get_projection("nope").is_err());
        assert!(matches!(
            manager.state::<RegistersProjection>("counters"),
            Err(ProjectionError::StateType { .. })
        ));
    }

    #[test]
    fn events_from_other_operations_are_skipped() {
        let op = OperationId::new();
        let manager = ProjectionManager::with_defaults(Arc::new(InMemoryEventStore::new()), Some(op));
        let mut ev = counter("K", 1, 1);
        assert_eq!(manager.apply(&ev).unwrap(), 0);
        ev.operation_id = Some(op);
        assert_eq!(manager.apply(&ev).unwrap(), 1);
    }

    #[test]
    fn listeners_see_new_state_and_can_unsubscribe() {
        let (_, manager) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sub = manager
            .subscribe("counters", move |state| {
                assert!(state.is_object());
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        manager.subscribe("counters", |_| panic!("listener bug")).unwrap();

        manager.apply(&counter("K", 1, 1)).unwrap();
        manager.apply(&register("R", 1, 1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        manager.apply(&counter("K", 1, 2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters(&manager)["K"], 2);
    }

    #[tokio::test]
    async fn attached_manager_follows_emits() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = EventBus::new(store.clone());
        let manager = Arc::new(ProjectionManager::with_defaults(store, None));
        let _sub = manager.attach(bus.registry());

        let meta = EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new());
        for amount in [5, 3] {
            bus.emit(
                EventPayload::CounterIncremented(CounterIncremented {
                    key: "K".to_string(),
                    amount,
                }),
                meta.clone(),
            )
            .await
            .unwrap();
        }
        assert_eq!(counters(&manager)["K"], 8);
    }

    #[tokio::test]
    async fn rebuild_from_snapshot_matches_full_replay() {
        let (store, manager) = setup();
        for ev in [counter("K", 2, 10), register("R", 1, 20), counter("K", 3, 30)] {
            store.append(ev).await.unwrap();
        }
        let snapshots = manager.snapshot().await.unwrap();
        assert!(snapshots.iter().all(|s| s.position == 3));

        // late remote events with older timestamps land after the snapshot
        store.record_remote(counter("K", 4, 5)).await.unwrap();
        store.record_remote(register("R", 9, 15)).await.unwrap();
        store.record_remote(register("R", 7, 25)).await.unwrap();

        let fresh = ProjectionManager::with_defaults(store.clone(), None);
        let summaries = fresh.rebuild(None).await.unwrap();
        let counters_summary = summaries.iter().find(|s| s.projection == "counters").unwrap();
        assert_eq!(counters_summary.snapshot_position, Some(3));
        assert_eq!(counters_summary.replayed, 3);

        let full = ProjectionManager::with_defaults(store.clone(), None);
        for stored in store.query(None, None).await.unwrap() {
            full.apply(&stored.event).unwrap();
        }
        for name in full.names() {
            assert_eq!(fresh.get_projection(name).unwrap(), full.get_projection(name).unwrap(), "{name}");
        }
        assert_eq!(counters(&fresh)["K"], 9);
        let registers: BTreeMap<String, RegisterEntry> = fresh.state::<RegistersProjection>("registers").unwrap();
        assert_eq!(registers["R"].value, RegisterValue::Int(7));
    }

    #[tokio::test]
    async fn snapshot_catches_up_on_undispatched_events() {
        let (store, manager) = setup();
        store.append(counter("K", 4, 10)).await.unwrap();
        let snapshot = manager.snapshot_projection("counters").await.unwrap();
        assert_eq!(snapshot.position, 1);
        assert_eq!(counters(&manager)["K"], 4);
    }

    #[tokio::test]
    async fn tampered_snapshot_falls_back_to_full_replay() {
        let (store, _) = setup();
        store.append(counter("K", 4, 10)).await.unwrap();
        let mut bad = Snapshot::new(
            "counters",
            None,
            1,
            Timestamp::now(),
            serde_json::json!({"state": {"K": 1000}, "applied": []}),
        );
        bad.state = serde_json::json!({"state": {"K": 1}, "applied": []});
        store.save_snapshot(bad).await.unwrap();

        let manager = ProjectionManager::with_defaults(store.clone(), None);
        let summary = manager.rebuild_projection("counters", None).await.unwrap();
        assert_eq!(summary.snapshot_position, None);
        assert_eq!(counters(&manager)["K"], 4);
    }

    #[tokio::test]
    async fn stale_snapshot_is_ignored_when_since_is_later() {
        let (store, manager) = setup();
        store.append(counter("K", 1, 10)).await.unwrap();
        let snapshot = manager.snapshot_projection("counters").await.unwrap();

        let summary = manager
            .rebuild_projection("counters", Some(snapshot.taken_at.plus_millis(1)))
            .await
            .unwrap();
        assert_eq!(summary.snapshot_position, None);

        let summary = manager
            .rebuild_projection("counters", Some(snapshot.taken_at))
            .await
            .unwrap();
        assert_eq!(summary.snapshot_position, Some(1));
        assert_eq!(counters(&manager)["K"], 1);
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        prop_oneof![
            (0usize..3, prop_oneof![-20i64..-1, 1i64..20], 0u64..1_000)
                .prop_map(|(k, amount, t)| counter(&format!("c{k}"), amount, t)),
            (0usize..3, any::<i64>(), 0u64..1_000).prop_map(|(k, value, t)| register(&format!("r{k}"), value, t)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn snapshot_plus_tail_equals_full_replay(
            events in prop::collection::vec(arb_event(), 1..40),
            split in 0usize..40,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let split = split.min(events.len());
                let store = Arc::new(InMemoryEventStore::new());
                let live = ProjectionManager::with_defaults(store.clone(), None);
                for ev in &events[..split] {
                    store.append(ev.clone()).await.unwrap();
                    live.apply(ev).unwrap();
                }
                live.snapshot().await.unwrap();
                for ev in &events[split..] {
                    store.record_remote(ev.clone()).await.unwrap();
                }

                let from_snapshot = ProjectionManager::with_defaults(store.clone(), None);
                from_snapshot.rebuild(None).await.unwrap();

                let scratch = ProjectionRunner::rebuild_from_scratch(CountersProjection, &events).unwrap();
                let registers = ProjectionRunner::rebuild_from_scratch(RegistersProjection, &events).unwrap();
                assert_eq!(&counters(&from_snapshot), scratch.state());
                assert_eq!(&from_snapshot.state::<RegistersProjection>("registers").unwrap(), registers.state());
            });
        }
    }
}
