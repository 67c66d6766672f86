//! Built-in projections and the manager that keeps them current.
//!
//! All projections are:
//! - **Rebuildable**: reconstructed from the event log (or a snapshot plus the tail)
//! - **Idempotent**: an event id is folded at most once
//! - **Order independent**: sums for counters, `LwwVersion` comparison for values

use serde::{Deserialize, Serialize};

use opsync_core::{EventId, Timestamp};
use opsync_events::Event;

pub mod conflicts;
pub mod counters;
pub mod county_status;
pub mod documents;
pub mod manager;
pub mod registers;
pub mod roster;

pub use conflicts::{ConflictsProjection, ConflictsState, OpenConflict};
pub use counters::CountersProjection;
pub use county_status::{CountyStatus, CountyStatusProjection};
pub use documents::{Document, DocumentsProjection, FieldValue, Section};
pub use manager::{ProjectionManager, ProjectionSubscription, RebuildSummary};
pub use registers::{RegisterEntry, RegistersProjection};
pub use roster::{RosterEntry, RosterProjection};

/// Version used for last-write-wins comparison.
///
/// Field order gives the comparison: timestamp, then device sequence, then
/// event id as the final tie-break.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LwwVersion {
    pub timestamp: Timestamp,
    pub sequence: u32,
    pub event_id: EventId,
}

impl LwwVersion {
    pub fn of(event: &Event) -> Self {
        let (timestamp, sequence, event_id) = event.ordering_key();
        Self {
            timestamp,
            sequence,
            event_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use opsync_core::{ActorId, DeviceId, SessionId, Stamp, Timestamp};
    use opsync_events::{CounterIncremented, Event, EventMetadata, EventPayload, RegisterSet, RegisterValue};

    pub fn event_at(payload: EventPayload, millis: u64) -> Event {
        Event::new(
            EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new()),
            Stamp::new(Timestamp::from_millis(millis), 0),
            payload,
        )
    }

    pub fn counter(key: &str, amount: i64, millis: u64) -> Event {
        event_at(
            EventPayload::CounterIncremented(CounterIncremented {
                key: key.to_string(),
                amount,
            }),
            millis,
        )
    }

    pub fn register(key: &str, value: i64, millis: u64) -> Event {
        event_at(
            EventPayload::RegisterSet(RegisterSet {
                key: key.to_string(),
                value: RegisterValue::Int(value),
            }),
            millis,
        )
    }

    pub fn reversed(events: &[Event]) -> impl Iterator<Item = &Event> {
        events.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::register;

    #[test]
    fn version_orders_by_timestamp_then_sequence() {
        let early = register("k", 1, 10);
        let mut late = register("k", 1, 10);
        late.sequence = Some(1);
        assert!(LwwVersion::of(&late) > LwwVersion::of(&early));

        let later = register("k", 1, 11);
        assert!(LwwVersion::of(&later) > LwwVersion::of(&late));
    }
}
