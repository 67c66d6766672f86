use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use opsync_core::{DeviceId, EventId, OperationId, Timestamp};
use opsync_events::{Event, EventType, ValidationError};

use super::outbox::{InboxItem, OutboxItem, OutboxStatus, OutboxUpdate, Snapshot};

/// An event as persisted, with its position in the local log.
///
/// Positions are assigned by the store in append order (local and remote
/// events alike), start at 1 and never repeat. They are a cursor for
/// snapshots, not the replay order: replay is by `Event::ordering_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub position: u64,
    /// `true` if appended through the outbox (emitted on this replica).
    pub local: bool,
    pub event: Event,
}

/// Event store operation error.
///
/// These are **infrastructure errors**. Append failures must reach the
/// caller: outbox correctness depends on knowing whether an append happened.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event {0} already exists")]
    DuplicateEvent(EventId),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid outbox transition for {event_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        event_id: EventId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        EventStoreError::Serialization(err.to_string())
    }
}

/// Counters for dashboards and tests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub events: usize,
    pub local_events: usize,
    pub outbox_pending: usize,
    pub outbox_sending: usize,
    pub outbox_sent: usize,
    pub outbox_failed: usize,
    pub inbox_unprocessed: usize,
    pub inbox_failed: usize,
    pub snapshots: usize,
}

/// Persistent home for the event log, its delivery queues and snapshots.
///
/// `operation` parameters scope reads to one operation; `None` reads across
/// all operations.
///
/// Implementations must:
/// - write an event and its outbox item atomically in `append`
/// - reject a second event with an existing id
/// - return query results ordered by `Event::ordering_key`
/// - surface I/O failures as errors, never drop them
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a locally emitted event and enqueue it for delivery.
    async fn append(&self, event: Event) -> Result<StoredEvent, EventStoreError>;

    /// Append an event received from the remote peer (no outbox item).
    ///
    /// Returns `None` when the event is already stored.
    async fn record_remote(&self, event: Event) -> Result<Option<StoredEvent>, EventStoreError>;

    async fn get(&self, event_id: EventId) -> Result<Option<StoredEvent>, EventStoreError>;

    /// Events of an operation, optionally only those after `since`.
    async fn query(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events stored after `position`, in replay order.
    async fn after_position(
        &self,
        operation: Option<OperationId>,
        position: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn by_type(&self, event_type: EventType, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest assigned position (0 when empty).
    async fn head_position(&self) -> Result<u64, EventStoreError>;

    /// Hash of the latest event this device appended locally.
    async fn chain_head(&self, device: DeviceId) -> Result<Option<String>, EventStoreError>;

    /// Due items: `pending` with `next_retry_at <= now`, oldest first.
    async fn pending_outbox(&self, now: Timestamp, limit: usize) -> Result<Vec<OutboxItem>, EventStoreError>;

    async fn outbox_item(&self, event_id: EventId) -> Result<Option<OutboxItem>, EventStoreError>;

    async fn update_outbox_status(
        &self,
        event_id: EventId,
        update: OutboxUpdate,
        now: Timestamp,
    ) -> Result<OutboxItem, EventStoreError>;

    /// Permanently failed items (kept until retried or resolved).
    async fn failed_outbox(&self) -> Result<Vec<OutboxItem>, EventStoreError>;

    /// Put a permanently failed item back in the queue with a fresh budget.
    async fn retry_outbox(&self, event_id: EventId, now: Timestamp) -> Result<OutboxItem, EventStoreError>;

    /// Drop `sent` items delivered before `sent_before`. Returns how many.
    async fn prune_outbox(&self, sent_before: Timestamp) -> Result<usize, EventStoreError>;

    /// Return every `sending` item to `pending` without using up a retry.
    ///
    /// Called when no delivery can be in flight (store open, cycle start), so
    /// an attempt cut short by a crash or a failed status write is retried.
    async fn requeue_sending(&self) -> Result<usize, EventStoreError>;

    /// Stage a remote event. Returns `false` if it was already staged or stored.
    async fn add_to_inbox(&self, event: Event, now: Timestamp) -> Result<bool, EventStoreError>;

    /// Staged events not yet processed, in replay order.
    async fn unprocessed_inbox(&self) -> Result<Vec<InboxItem>, EventStoreError>;

    /// Record the outcome of applying one inbox item.
    ///
    /// A failed item stays unprocessed (retried on the next pass) and keeps
    /// its error for inspection.
    async fn mark_inbox_item(
        &self,
        event_id: EventId,
        outcome: Result<(), String>,
        now: Timestamp,
    ) -> Result<(), EventStoreError>;

    /// Drop inbox items processed before `processed_before`. Returns how many.
    async fn prune_inbox(&self, processed_before: Timestamp) -> Result<usize, EventStoreError>;

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;

    async fn latest_snapshot(
        &self,
        projection: &str,
        operation: Option<OperationId>,
    ) -> Result<Option<Snapshot>, EventStoreError>;

    /// Timestamp of the newest remote event seen by the last successful pull.
    async fn sync_cursor(&self, operation: Option<OperationId>) -> Result<Option<Timestamp>, EventStoreError>;

    async fn set_sync_cursor(&self, operation: Option<OperationId>, cursor: Timestamp) -> Result<(), EventStoreError>;

    async fn stats(&self) -> Result<StoreStats, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, event: Event) -> Result<StoredEvent, EventStoreError> {
        (**self).append(event).await
    }

    async fn record_remote(&self, event: Event) -> Result<Option<StoredEvent>, EventStoreError> {
        (**self).record_remote(event).await
    }

    async fn get(&self, event_id: EventId) -> Result<Option<StoredEvent>, EventStoreError> {
        (**self).get(event_id).await
    }

    async fn query(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).query(operation, since).await
    }

    async fn after_position(
        &self,
        operation: Option<OperationId>,
        position: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).after_position(operation, position).await
    }

    async fn by_type(&self, event_type: EventType, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).by_type(event_type, limit).await
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        (**self).head_position().await
    }

    async fn chain_head(&self, device: DeviceId) -> Result<Option<String>, EventStoreError> {
        (**self).chain_head(device).await
    }

    async fn pending_outbox(&self, now: Timestamp, limit: usize) -> Result<Vec<OutboxItem>, EventStoreError> {
        (**self).pending_outbox(now, limit).await
    }

    async fn outbox_item(&self, event_id: EventId) -> Result<Option<OutboxItem>, EventStoreError> {
        (**self).outbox_item(event_id).await
    }

    async fn update_outbox_status(
        &self,
        event_id: EventId,
        update: OutboxUpdate,
        now: Timestamp,
    ) -> Result<OutboxItem, EventStoreError> {
        (**self).update_outbox_status(event_id, update, now).await
    }

    async fn failed_outbox(&self) -> Result<Vec<OutboxItem>, EventStoreError> {
        (**self).failed_outbox().await
    }

    async fn retry_outbox(&self, event_id: EventId, now: Timestamp) -> Result<OutboxItem, EventStoreError> {
        (**self).retry_outbox(event_id, now).await
    }

    async fn prune_outbox(&self, sent_before: Timestamp) -> Result<usize, EventStoreError> {
        (**self).prune_outbox(sent_before).await
    }

    async fn requeue_sending(&self) -> Result<usize, EventStoreError> {
        (**self).requeue_sending().await
    }

    async fn add_to_inbox(&self, event: Event, now: Timestamp) -> Result<bool, EventStoreError> {
        (**self).add_to_inbox(event, now).await
    }

    async fn unprocessed_inbox(&self) -> Result<Vec<InboxItem>, EventStoreError> {
        (**self).unprocessed_inbox().await
    }

    async fn mark_inbox_item(
        &self,
        event_id: EventId,
        outcome: Result<(), String>,
        now: Timestamp,
    ) -> Result<(), EventStoreError> {
        (**self).mark_inbox_item(event_id, outcome, now).await
    }

    async fn prune_inbox(&self, processed_before: Timestamp) -> Result<usize, EventStoreError> {
        (**self).prune_inbox(processed_before).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        (**self).save_snapshot(snapshot).await
    }

    async fn latest_snapshot(
        &self,
        projection: &str,
        operation: Option<OperationId>,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).latest_snapshot(projection, operation).await
    }

    async fn sync_cursor(&self, operation: Option<OperationId>) -> Result<Option<Timestamp>, EventStoreError> {
        (**self).sync_cursor(operation).await
    }

    async fn set_sync_cursor(&self, operation: Option<OperationId>, cursor: Timestamp) -> Result<(), EventStoreError> {
        (**self).set_sync_cursor(operation, cursor).await
    }

    async fn stats(&self) -> Result<StoreStats, EventStoreError> {
        (**self).stats().await
    }
}
