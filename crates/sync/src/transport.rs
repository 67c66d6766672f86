//! Remote peer port and the in-process peer.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use opsync_core::{CorrelationId, EventId, OperationId, Timestamp};
use opsync_events::Event;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("transport not configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Errors that mean "the network is gone" rather than "the request was bad".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout)
    }
}

/// Events returned by one pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchBatch {
    pub events: Vec<Event>,
    /// Value to pass as `since` on the next pull. When the peer does not
    /// supply one, the newest event timestamp is used.
    #[serde(default)]
    pub cursor: Option<Timestamp>,
}

impl FetchBatch {
    pub fn next_cursor(&self) -> Option<Timestamp> {
        self.cursor.or_else(|| self.events.iter().map(|e| e.timestamp).max())
    }
}

/// The remote side of the delivery contract.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Deliver one batch. Redelivering a batch with the same key must be safe.
    async fn send(&self, idempotency_key: CorrelationId, events: &[Event]) -> Result<(), TransportError>;

    /// Events received by the peer after `since`, in replay order.
    async fn fetch(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<FetchBatch, TransportError>;
}

#[derive(Debug, Default)]
struct RemoteState {
    /// `(received_at, event)` in arrival order.
    log: Vec<(Timestamp, Event)>,
    ids: HashSet<EventId>,
    keys: HashSet<CorrelationId>,
    last_received: Timestamp,
    unreachable: bool,
    fail_sends: u32,
    replayed_batches: u64,
}

/// An in-process peer: a shared event log several replicas sync through.
///
/// Like an idempotent server, a batch whose key was already accepted is
/// acknowledged without being stored again. Events are also stored once per
/// id. Pulls filter on the peer's own receipt time, so events that reach the
/// peer late (from a device that was offline) are still delivered to
/// everyone.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the network going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Reject the next `count` sends with a server error.
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().fail_sends = count;
    }

    /// Every event the peer holds, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().log.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn seen_keys(&self) -> usize {
        self.lock().keys.len()
    }

    /// Batches acknowledged as replays of an already accepted key.
    pub fn replayed_batches(&self) -> u64 {
        self.lock().replayed_batches
    }
}

#[async_trait]
impl RemotePeer for InMemoryRemote {
    async fn send(&self, idempotency_key: CorrelationId, events: &[Event]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable("in-memory peer offline".to_string()));
        }
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(TransportError::Rejected {
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        if !state.keys.insert(idempotency_key) {
            state.replayed_batches += 1;
            tracing::debug!(key = %idempotency_key, events = events.len(), "replayed batch acknowledged");
            return Ok(());
        }
        for event in events {
            if !state.ids.insert(event.id) {
                continue;
            }
            // strictly increasing receipt time
            let received_at = Timestamp::now().max(state.last_received.plus_millis(1));
            state.last_received = received_at;
            state.log.push((received_at, event.clone()));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<FetchBatch, TransportError> {
        let state = self.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable("in-memory peer offline".to_string()));
        }
        let mut selected: Vec<&(Timestamp, Event)> = state
            .log
            .iter()
            .filter(|(received_at, _)| since.is_none_or(|t| *received_at > t))
            .filter(|(_, event)| event.in_operation(operation))
            .collect();
        let cursor = selected.iter().map(|(received_at, _)| *received_at).max().or(since);
        selected.sort_by_key(|(_, event)| event.ordering_key());
        Ok(FetchBatch {
            events: selected.into_iter().map(|(_, e)| e.clone()).collect(),
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp};
    use opsync_events::{CounterIncremented, EventMetadata, EventPayload};

    fn event(millis: u64) -> Event {
        Event::new(
            EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new()),
            Stamp::new(Timestamp::from_millis(millis), 0),
            EventPayload::CounterIncremented(CounterIncremented {
                key: "k".to_string(),
                amount: 1,
            }),
        )
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let remote = InMemoryRemote::new();
        let batch = vec![event(1), event(2)];
        let key = batch[0].correlation_id;
        remote.send(key, &batch).await.unwrap();
        remote.send(key, &batch).await.unwrap();
        assert_eq!(remote.events().len(), 2);
        assert_eq!(remote.replayed_batches(), 1);
        assert_eq!(remote.seen_keys(), 1);
    }

    #[tokio::test]
    async fn a_reused_key_is_treated_as_a_replay() {
        let remote = InMemoryRemote::new();
        let key = CorrelationId::new();
        remote.send(key, &[event(1)]).await.unwrap();
        remote.send(key, &[event(2)]).await.unwrap();
        assert_eq!(remote.events().len(), 1);
        assert_eq!(remote.replayed_batches(), 1);
    }

    #[tokio::test]
    async fn fetch_uses_receipt_cursor_and_replay_order() {
        let remote = InMemoryRemote::new();
        remote.send(CorrelationId::new(), &[event(50)]).await.unwrap();
        let first = remote.fetch(None, None).await.unwrap();
        assert_eq!(first.events.len(), 1);

        // arrives late with an older timestamp; still delivered after the cursor
        remote.send(CorrelationId::new(), &[event(10), event(5)]).await.unwrap();
        let second = remote.fetch(None, first.next_cursor()).await.unwrap();
        let stamps: Vec<u64> = second.events.iter().map(|e| e.timestamp.as_millis()).collect();
        assert_eq!(stamps, vec![5, 10]);

        let third = remote.fetch(None, second.next_cursor()).await.unwrap();
        assert!(third.events.is_empty());
        assert_eq!(third.next_cursor(), second.next_cursor());
    }

    #[tokio::test]
    async fn fault_injection() {
        let remote = InMemoryRemote::new();
        remote.fail_next_sends(1);
        let err = remote.send(CorrelationId::new(), &[event(1)]).await.unwrap_err();
        assert!(!err.is_connectivity());
        remote.send(CorrelationId::new(), &[event(1)]).await.unwrap();

        remote.set_reachable(false);
        assert!(remote.fetch(None, None).await.unwrap_err().is_connectivity());
    }
}
