//! Event log storage boundary.
//!
//! The `EventStore` port keeps the log, the outbox, the inbox and projection
//! snapshots together so that an event and its outbox item are written in one
//! step. Two adapters: in-memory (tests/dev) and SQLite (embedded, durable).

use std::future::Future;

use opsync_core::Timestamp;
use opsync_events::Event;

pub mod in_memory;
pub mod outbox;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use outbox::{InboxItem, InboxReport, OutboxItem, OutboxStatus, OutboxUpdate, RetryPolicy, Snapshot};
pub use sqlite::SqliteEventStore;
pub use r#trait::{EventStore, EventStoreError, StoreStats, StoredEvent};

/// Apply every unprocessed inbox item, in replay order.
///
/// Each item's outcome is recorded on its own: a failing item keeps its error
/// and stays staged for the next pass without blocking the rest. Only store
/// errors abort the pass.
pub async fn process_inbox<S, F, Fut, T>(
    store: &S,
    now: Timestamp,
    mut apply: F,
) -> Result<InboxReport<T>, EventStoreError>
where
    S: EventStore + ?Sized,
    F: FnMut(Event) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut report = InboxReport::default();
    for item in store.unprocessed_inbox().await? {
        let event_id = item.event.id;
        match apply(item.event).await {
            Ok(value) => {
                store.mark_inbox_item(event_id, Ok(()), now).await?;
                report.applied.push((event_id, value));
            }
            Err(error) => {
                tracing::warn!(event_id = %event_id, error = %error, "inbox item failed to apply");
                store.mark_inbox_item(event_id, Err(error.clone()), now).await?;
                report.failed.push((event_id, error));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp};
    use opsync_events::{CounterIncremented, EventMetadata, EventPayload};

    fn event(amount: i64, millis: u64) -> Event {
        Event::new(
            EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new()),
            Stamp::new(Timestamp::from_millis(millis), 0),
            EventPayload::CounterIncremented(CounterIncremented {
                key: "k".to_string(),
                amount,
            }),
        )
    }

    #[tokio::test]
    async fn one_bad_item_does_not_block_the_rest() {
        let store = InMemoryEventStore::new();
        let now = Timestamp::from_millis(1);
        store.add_to_inbox(event(3, 30), now).await.unwrap();
        store.add_to_inbox(event(-1, 10), now).await.unwrap();
        store.add_to_inbox(event(2, 20), now).await.unwrap();

        let report = process_inbox(&store, now, |ev| async move {
            match &ev.payload {
                EventPayload::CounterIncremented(p) if p.amount < 0 => Err("negative".to_string()),
                EventPayload::CounterIncremented(p) => Ok(p.amount),
                _ => Ok(0),
            }
        })
        .await
        .unwrap();

        let applied: Vec<i64> = report.applied.iter().map(|(_, v)| *v).collect();
        assert_eq!(applied, vec![2, 3]);
        assert_eq!(report.failed.len(), 1);

        let remaining = store.unprocessed_inbox().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].error.as_deref(), Some("negative"));
    }
}
