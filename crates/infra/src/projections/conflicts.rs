use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use opsync_core::Timestamp;
use opsync_events::{EntityKey, Event, EventPayload, EventType, Projection};

/// An escalated conflict awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConflict {
    pub entity: EntityKey,
    pub event_type: EventType,
    pub local: Event,
    pub remote: Event,
    pub detected_at: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictsState {
    /// Keyed by conflict id.
    pub open: BTreeMap<String, OpenConflict>,
    /// Conflict ids closed by a `ConflictResolved`; a detection arriving after
    /// its resolution stays closed.
    pub resolved: BTreeSet<String>,
}

impl ConflictsState {
    pub fn is_open(&self, conflict_id: &str) -> bool {
        self.open.contains_key(conflict_id)
    }
}

/// Unresolved manual conflicts.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConflictsProjection;

impl ConflictsProjection {
    pub const NAME: &'static str = "conflicts";
}

impl Projection for ConflictsProjection {
    type State = ConflictsState;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        ConflictsState::default()
    }

    fn handles(&self, event_type: EventType) -> bool {
        matches!(event_type, EventType::ConflictDetected | EventType::ConflictResolved)
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        match &event.payload {
            EventPayload::ConflictDetected(p) => {
                let id = p.conflict_id.to_string();
                if !state.resolved.contains(&id) {
                    state.open.insert(
                        id,
                        OpenConflict {
                            entity: p.entity.clone(),
                            event_type: p.local.event_type,
                            local: (*p.local).clone(),
                            remote: (*p.remote).clone(),
                            detected_at: event.timestamp,
                        },
                    );
                }
            }
            EventPayload::ConflictResolved(p) => {
                if let Some(conflict_id) = p.conflict_id {
                    let id = conflict_id.to_string();
                    state.open.remove(&id);
                    state.resolved.insert(id);
                }
            }
            _ => {}
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{event_at, register, reversed};
    use opsync_core::ConflictId;
    use opsync_events::{ConflictDetected, ConflictResolved, ProjectionRunner, ResolutionStrategy};

    fn detected(conflict_id: ConflictId, millis: u64) -> Event {
        let local = register("K", 1, 10);
        let remote = register("K", 2, 11);
        event_at(
            EventPayload::ConflictDetected(ConflictDetected {
                conflict_id,
                entity: EntityKey::new("register", "K"),
                local: Box::new(local),
                remote: Box::new(remote),
            }),
            millis,
        )
    }

    fn resolved(conflict_id: ConflictId, millis: u64) -> Event {
        event_at(
            EventPayload::ConflictResolved(ConflictResolved {
                conflict_id: Some(conflict_id),
                entity: EntityKey::new("register", "K"),
                strategy: ResolutionStrategy::Manual,
                winner: None,
                discarded: vec![],
                merged: Some(opsync_core::EventId::new()),
            }),
            millis,
        )
    }

    #[test]
    fn detection_opens_and_resolution_closes() {
        let id = ConflictId::new();
        let mut runner = ProjectionRunner::new(ConflictsProjection);
        runner.apply(&detected(id, 20)).unwrap();
        assert!(runner.state().is_open(&id.to_string()));
        assert_eq!(runner.state().open[&id.to_string()].event_type, EventType::RegisterSet);

        runner.apply(&resolved(id, 30)).unwrap();
        assert!(runner.state().open.is_empty());
    }

    #[test]
    fn resolution_seen_first_keeps_conflict_closed() {
        let id = ConflictId::new();
        let events = vec![detected(id, 20), resolved(id, 30)];
        let backward = ProjectionRunner::rebuild_from_scratch(ConflictsProjection, reversed(&events)).unwrap();
        assert!(backward.state().open.is_empty());
        assert!(backward.state().resolved.contains(&id.to_string()));
    }
}
