use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use opsync_core::{DeviceId, EventId, OperationId, Timestamp};
use opsync_events::{DeliveryStatus, Event, EventType};

use super::outbox::{InboxItem, OutboxItem, OutboxStatus, OutboxUpdate, RetryPolicy, Snapshot};
use super::r#trait::{EventStore, EventStoreError, StoreStats, StoredEvent};

type SnapshotKey = (String, Option<OperationId>);

#[derive(Debug, Default)]
struct State {
    log: Vec<StoredEvent>,
    index: HashMap<EventId, usize>,
    outbox: HashMap<EventId, OutboxItem>,
    inbox: HashMap<EventId, InboxItem>,
    snapshots: HashMap<SnapshotKey, Snapshot>,
    cursors: HashMap<Option<OperationId>, Timestamp>,
}

impl State {
    fn push(&mut self, event: Event, local: bool) -> StoredEvent {
        let stored = StoredEvent {
            position: self.log.len() as u64 + 1,
            local,
            event,
        };
        self.index.insert(stored.event.id, self.log.len());
        self.log.push(stored.clone());
        stored
    }

    fn mirror(&mut self, item: &OutboxItem) {
        if let Some(&idx) = self.index.get(&item.event.id) {
            let ev = &mut self.log[idx].event;
            ev.sync_status = item.event.sync_status;
            ev.sync_attempts = item.event.sync_attempts;
            ev.sync_error = item.event.sync_error.clone();
        }
    }

    fn sorted(mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        events.sort_by_key(|s| s.event.ordering_key());
        events
    }
}

/// In-memory event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
    retry: RetryPolicy,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            state: RwLock::default(),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, EventStoreError> {
        self.state
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: Event) -> Result<StoredEvent, EventStoreError> {
        event.validate()?;
        let now = Timestamp::now();
        let mut state = self.write()?;
        if state.index.contains_key(&event.id) {
            return Err(EventStoreError::DuplicateEvent(event.id));
        }
        let item = OutboxItem::new(event, self.retry.max_retries, now);
        let stored = state.push(item.event.clone(), true);
        state.outbox.insert(stored.event.id, item);
        Ok(stored)
    }

    async fn record_remote(&self, mut event: Event) -> Result<Option<StoredEvent>, EventStoreError> {
        event.validate()?;
        let mut state = self.write()?;
        if state.index.contains_key(&event.id) {
            return Ok(None);
        }
        event.sync_status = DeliveryStatus::Synced;
        Ok(Some(state.push(event, false)))
    }

    async fn get(&self, event_id: EventId) -> Result<Option<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        Ok(state.index.get(&event_id).map(|&i| state.log[i].clone()))
    }

    async fn query(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        let events = state
            .log
            .iter()
            .filter(|s| s.event.in_operation(operation))
            .filter(|s| since.is_none_or(|t| s.event.timestamp > t))
            .cloned()
            .collect();
        Ok(State::sorted(events))
    }

    async fn after_position(
        &self,
        operation: Option<OperationId>,
        position: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(state.log.len());
        let events = state.log[start..]
            .iter()
            .filter(|s| s.event.in_operation(operation))
            .cloned()
            .collect();
        Ok(State::sorted(events))
    }

    async fn by_type(&self, event_type: EventType, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        let events = state
            .log
            .iter()
            .filter(|s| s.event.event_type == event_type)
            .cloned()
            .collect();
        let mut events = State::sorted(events);
        events.truncate(limit);
        Ok(events)
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        Ok(self.read()?.log.len() as u64)
    }

    async fn chain_head(&self, device: DeviceId) -> Result<Option<String>, EventStoreError> {
        let state = self.read()?;
        Ok(state
            .log
            .iter()
            .rev()
            .find(|s| s.local && s.event.device_id == device)
            .and_then(|s| s.event.hash.clone()))
    }

    async fn pending_outbox(&self, now: Timestamp, limit: usize) -> Result<Vec<OutboxItem>, EventStoreError> {
        let state = self.read()?;
        let mut due: Vec<OutboxItem> = state.outbox.values().filter(|i| i.is_due(now)).cloned().collect();
        due.sort_by_key(|i| i.event.ordering_key());
        due.truncate(limit);
        Ok(due)
    }

    async fn outbox_item(&self, event_id: EventId) -> Result<Option<OutboxItem>, EventStoreError> {
        Ok(self.read()?.outbox.get(&event_id).cloned())
    }

    async fn update_outbox_status(
        &self,
        event_id: EventId,
        update: OutboxUpdate,
        now: Timestamp,
    ) -> Result<OutboxItem, EventStoreError> {
        let mut state = self.write()?;
        let item = state
            .outbox
            .get_mut(&event_id)
            .ok_or_else(|| EventStoreError::NotFound(format!("outbox item {event_id}")))?;
        item.transition(&update, now, &self.retry)?;
        let item = item.clone();
        state.mirror(&item);
        Ok(item)
    }

    async fn failed_outbox(&self) -> Result<Vec<OutboxItem>, EventStoreError> {
        let state = self.read()?;
        let mut failed: Vec<OutboxItem> = state
            .outbox
            .values()
            .filter(|i| i.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|i| i.event.ordering_key());
        Ok(failed)
    }

    async fn retry_outbox(&self, event_id: EventId, now: Timestamp) -> Result<OutboxItem, EventStoreError> {
        let mut state = self.write()?;
        let item = state
            .outbox
            .get_mut(&event_id)
            .ok_or_else(|| EventStoreError::NotFound(format!("outbox item {event_id}")))?;
        if item.status != OutboxStatus::Failed {
            return Err(EventStoreError::InvalidTransition {
                event_id,
                from: item.status,
                to: OutboxStatus::Pending,
            });
        }
        item.reset(now);
        let item = item.clone();
        state.mirror(&item);
        Ok(item)
    }

    async fn prune_outbox(&self, sent_before: Timestamp) -> Result<usize, EventStoreError> {
        let mut state = self.write()?;
        let before = state.outbox.len();
        state.outbox.retain(|_, item| {
            !(item.status == OutboxStatus::Sent && item.sent_at.is_some_and(|t| t < sent_before))
        });
        Ok(before - state.outbox.len())
    }

    async fn requeue_sending(&self) -> Result<usize, EventStoreError> {
        let mut state = self.write()?;
        let mut requeued = Vec::new();
        for item in state.outbox.values_mut() {
            if item.requeue() {
                requeued.push(item.clone());
            }
        }
        for item in &requeued {
            state.mirror(item);
        }
        Ok(requeued.len())
    }

    async fn add_to_inbox(&self, event: Event, now: Timestamp) -> Result<bool, EventStoreError> {
        let mut state = self.write()?;
        if state.inbox.contains_key(&event.id) || state.index.contains_key(&event.id) {
            return Ok(false);
        }
        state.inbox.insert(event.id, InboxItem::new(event, now));
        Ok(true)
    }

    async fn unprocessed_inbox(&self) -> Result<Vec<InboxItem>, EventStoreError> {
        let state = self.read()?;
        let mut items: Vec<InboxItem> = state.inbox.values().filter(|i| !i.processed).cloned().collect();
        items.sort_by_key(|i| i.event.ordering_key());
        Ok(items)
    }

    async fn mark_inbox_item(
        &self,
        event_id: EventId,
        outcome: Result<(), String>,
        now: Timestamp,
    ) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        let item = state
            .inbox
            .get_mut(&event_id)
            .ok_or_else(|| EventStoreError::NotFound(format!("inbox item {event_id}")))?;
        match outcome {
            Ok(()) => {
                item.processed = true;
                item.processed_at = Some(now);
                item.error = None;
            }
            Err(error) => item.error = Some(error),
        }
        Ok(())
    }

    async fn prune_inbox(&self, processed_before: Timestamp) -> Result<usize, EventStoreError> {
        let mut state = self.write()?;
        let before = state.inbox.len();
        state
            .inbox
            .retain(|_, item| !(item.processed && item.processed_at.is_some_and(|t| t < processed_before)));
        Ok(before - state.inbox.len())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        let key = (snapshot.projection.clone(), snapshot.operation_id);
        state.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        projection: &str,
        operation: Option<OperationId>,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let state = self.read()?;
        Ok(state.snapshots.get(&(projection.to_string(), operation)).cloned())
    }

    async fn sync_cursor(&self, operation: Option<OperationId>) -> Result<Option<Timestamp>, EventStoreError> {
        Ok(self.read()?.cursors.get(&operation).copied())
    }

    async fn set_sync_cursor(&self, operation: Option<OperationId>, cursor: Timestamp) -> Result<(), EventStoreError> {
        self.write()?.cursors.insert(operation, cursor);
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, EventStoreError> {
        let state = self.read()?;
        let mut stats = StoreStats {
            events: state.log.len(),
            local_events: state.log.iter().filter(|s| s.local).count(),
            snapshots: state.snapshots.len(),
            ..StoreStats::default()
        };
        for item in state.outbox.values() {
            match item.status {
                OutboxStatus::Pending => stats.outbox_pending += 1,
                OutboxStatus::Sending => stats.outbox_sending += 1,
                OutboxStatus::Sent => stats.outbox_sent += 1,
                OutboxStatus::Failed => stats.outbox_failed += 1,
            }
        }
        for item in state.inbox.values().filter(|i| !i.processed) {
            stats.inbox_unprocessed += 1;
            if item.error.is_some() {
                stats.inbox_failed += 1;
            }
        }
        Ok(stats)
    }
}
