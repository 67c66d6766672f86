//! Delivery queues and checkpoints kept next to the log.
//!
//! - `OutboxItem`: a local event awaiting delivery, with its retry schedule
//! - `InboxItem`: a remote event awaiting local application
//! - `Snapshot`: a projection checkpoint with its own digest

use std::time::Duration;

use serde::{Deserialize, Serialize};

use opsync_core::{EventId, OperationId, Timestamp};
use opsync_events::{DeliveryStatus, Event, integrity};

use super::r#trait::EventStoreError;

/// Outbox item status.
///
/// `pending → sending → sent`, or `sending → pending` (retry scheduled) until
/// the retry budget is spent, then `failed` until an operator retries it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "sending" => Some(OutboxStatus::Sending),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Failed)
    }
}

/// Requested outbox transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxUpdate {
    /// `pending → sending` (claims the item).
    Sending,
    Sent,
    /// Counts against the retry budget; reschedules or fails permanently.
    Failed(String),
}

impl OutboxUpdate {
    pub fn target(&self) -> OutboxStatus {
        match self {
            OutboxUpdate::Sending => OutboxStatus::Sending,
            OutboxUpdate::Sent => OutboxStatus::Sent,
            OutboxUpdate::Failed(_) => OutboxStatus::Failed,
        }
    }
}

/// Outbox backoff.
///
/// After the n-th failure the next attempt is due `base * 2^(n-1)` later,
/// capped at `max_delay`. The item is failed permanently once it has failed
/// `max_retries` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the next attempt, given how many failures happened so far.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// A local event waiting for remote delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub event: Event,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Timestamp,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
}

impl OutboxItem {
    pub fn new(event: Event, max_retries: u32, now: Timestamp) -> Self {
        let mut item = Self {
            event,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries,
            next_retry_at: now,
            last_error: None,
            created_at: now,
            sent_at: None,
        };
        item.sync_bookkeeping();
        item
    }

    pub fn event_id(&self) -> EventId {
        self.event.id
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at <= now
    }

    pub fn mark_sending(&mut self) {
        self.status = OutboxStatus::Sending;
    }

    pub fn mark_sent(&mut self, now: Timestamp) {
        self.status = OutboxStatus::Sent;
        self.sent_at = Some(now);
        self.last_error = None;
    }

    /// Record a failed attempt and schedule the next one (or give up).
    pub fn mark_failed(&mut self, error: impl Into<String>, now: Timestamp, policy: &RetryPolicy) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        if self.retry_count >= self.max_retries {
            self.status = OutboxStatus::Failed;
        } else {
            self.status = OutboxStatus::Pending;
            let delay = policy.delay_after(self.retry_count);
            self.next_retry_at = now.plus_millis(delay.as_millis() as u64);
        }
    }

    /// Hand a `sending` item whose attempt never finished back to the queue.
    ///
    /// The attempt is not counted against the retry budget: the peer may have
    /// received the batch, and redelivery under the same key is safe.
    pub fn requeue(&mut self) -> bool {
        if self.status != OutboxStatus::Sending {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.sync_bookkeeping();
        true
    }

    /// Operator override: give a permanently failed item a fresh budget.
    pub fn reset(&mut self, now: Timestamp) {
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = now;
        self.sync_bookkeeping();
    }

    /// Apply a requested transition, rejecting ones the lifecycle forbids.
    ///
    /// `sent → sent` is accepted so a redelivered acknowledgement is harmless.
    pub fn transition(
        &mut self,
        update: &OutboxUpdate,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Result<(), EventStoreError> {
        let allowed = matches!(
            (self.status, update),
            (OutboxStatus::Pending, OutboxUpdate::Sending)
                | (OutboxStatus::Pending | OutboxStatus::Sending | OutboxStatus::Sent, OutboxUpdate::Sent)
                | (OutboxStatus::Pending | OutboxStatus::Sending, OutboxUpdate::Failed(_))
        );
        if !allowed {
            return Err(EventStoreError::InvalidTransition {
                event_id: self.event.id,
                from: self.status,
                to: update.target(),
            });
        }
        match update {
            OutboxUpdate::Sending => self.mark_sending(),
            OutboxUpdate::Sent if self.status == OutboxStatus::Sent => {}
            OutboxUpdate::Sent => self.mark_sent(now),
            OutboxUpdate::Failed(error) => self.mark_failed(error.clone(), now, policy),
        }
        self.sync_bookkeeping();
        Ok(())
    }

    /// Mirror the delivery state onto the wrapped event.
    pub fn sync_bookkeeping(&mut self) {
        self.event.sync_status = match self.status {
            OutboxStatus::Pending | OutboxStatus::Sending => DeliveryStatus::Pending,
            OutboxStatus::Sent => DeliveryStatus::Synced,
            OutboxStatus::Failed => DeliveryStatus::Failed,
        };
        self.event.sync_attempts = self.retry_count;
        self.event.sync_error = self.last_error.clone();
    }
}

/// A remote event staged for local application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    pub event: Event,
    pub received_at: Timestamp,
    pub processed: bool,
    pub processed_at: Option<Timestamp>,
    pub error: Option<String>,
}

impl InboxItem {
    pub fn new(event: Event, received_at: Timestamp) -> Self {
        Self {
            event,
            received_at,
            processed: false,
            processed_at: None,
            error: None,
        }
    }
}

/// Per-item results of one inbox pass.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxReport<T> {
    pub applied: Vec<(EventId, T)>,
    pub failed: Vec<(EventId, String)>,
}

impl<T> Default for InboxReport<T> {
    fn default() -> Self {
        Self {
            applied: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Checkpoint of one projection's runner state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub projection: String,
    pub operation_id: Option<OperationId>,
    /// Store position of the last event included.
    pub position: u64,
    pub taken_at: Timestamp,
    pub state: serde_json::Value,
    pub digest: String,
}

#[derive(Serialize)]
struct SnapshotBody<'a> {
    projection: &'a str,
    operation_id: &'a Option<OperationId>,
    position: u64,
    state: &'a serde_json::Value,
}

impl Snapshot {
    pub fn new(
        projection: impl Into<String>,
        operation_id: Option<OperationId>,
        position: u64,
        taken_at: Timestamp,
        state: serde_json::Value,
    ) -> Self {
        let mut snapshot = Self {
            projection: projection.into(),
            operation_id,
            position,
            taken_at,
            state,
            digest: String::new(),
        };
        snapshot.digest = snapshot.compute_digest();
        snapshot
    }

    fn compute_digest(&self) -> String {
        let body = SnapshotBody {
            projection: &self.projection,
            operation_id: &self.operation_id,
            position: self.position,
            state: &self.state,
        };
        // Serializing a Value with string keys cannot fail.
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        integrity::digest_bytes(&bytes)
    }

    pub fn verify(&self) -> bool {
        self.digest == self.compute_digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp};
    use opsync_events::{CounterIncremented, EventMetadata, EventPayload};
    use proptest::prelude::*;

    fn item(max_retries: u32) -> OutboxItem {
        let event = Event::new(
            EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new()),
            Stamp::default(),
            EventPayload::CounterIncremented(CounterIncremented {
                key: "k".to_string(),
                amount: 1,
            }),
        );
        OutboxItem::new(event, max_retries, Timestamp::ZERO)
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.delay_after(40), Duration::from_secs(3600));
    }

    #[test]
    fn fails_permanently_exactly_at_max_retries() {
        let policy = RetryPolicy::default();
        let mut item = item(5);
        let now = Timestamp::from_millis(10_000);

        for attempt in 1..=4 {
            item.mark_failed("offline", now, &policy);
            assert_eq!(item.status, OutboxStatus::Pending, "attempt {attempt}");
            assert_eq!(item.retry_count, attempt);
        }
        assert_eq!(item.next_retry_at, now.plus_millis(8_000));

        item.mark_failed("offline", now, &policy);
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(item.retry_count, 5);
        assert!(!item.is_due(Timestamp::from_millis(u64::MAX)));
    }

    #[test]
    fn reset_gives_a_fresh_budget() {
        let policy = RetryPolicy::default();
        let mut item = item(1);
        item.mark_failed("boom", Timestamp::ZERO, &policy);
        assert_eq!(item.status, OutboxStatus::Failed);

        item.reset(Timestamp::from_millis(5));
        assert!(item.is_due(Timestamp::from_millis(5)));
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let policy = RetryPolicy::default();
        let mut item = item(3);
        let now = Timestamp::from_millis(1);

        item.transition(&OutboxUpdate::Sending, now, &policy).unwrap();
        assert!(item.transition(&OutboxUpdate::Sending, now, &policy).is_err());

        item.transition(&OutboxUpdate::Failed("timeout".to_string()), now, &policy).unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
        assert_eq!(item.event.sync_status, DeliveryStatus::Pending);
        assert_eq!(item.event.sync_attempts, 1);
        assert_eq!(item.event.sync_error.as_deref(), Some("timeout"));

        item.transition(&OutboxUpdate::Sending, now, &policy).unwrap();
        item.transition(&OutboxUpdate::Sent, now, &policy).unwrap();
        item.transition(&OutboxUpdate::Sent, now, &policy).unwrap();
        assert_eq!(item.event.sync_status, DeliveryStatus::Synced);

        let err = item
            .transition(&OutboxUpdate::Failed("late".to_string()), now, &policy)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidTransition { from: OutboxStatus::Sent, .. }));
    }

    #[test]
    fn snapshot_digest_detects_tampering() {
        let mut snap = Snapshot::new("counters", None, 3, Timestamp::ZERO, serde_json::json!({"k": 1}));
        assert!(snap.verify());
        snap.state = serde_json::json!({"k": 2});
        assert!(!snap.verify());
    }

    proptest! {
        #[test]
        fn retry_times_never_decrease(failures in 1u32..12) {
            let policy = RetryPolicy::default().with_max_retries(100);
            let mut item = item(100);
            let mut last_delay = 0u64;
            for _ in 0..failures {
                item.mark_failed("x", Timestamp::ZERO, &policy);
                let delay = item.next_retry_at.as_millis();
                prop_assert!(delay >= last_delay);
                prop_assert_eq!(delay, 1000u64 << (item.retry_count - 1));
                last_delay = delay;
            }
        }
    }
}
