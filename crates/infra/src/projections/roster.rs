use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use opsync_events::{Event, EventPayload, EventType, Projection};

use super::LwwVersion;

/// Current assignment of one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub roles: BTreeSet<String>,
    pub assignment: Option<String>,
    pub active: bool,
    pub version: LwwVersion,
}

/// Who is assigned where, with which roles.
///
/// Each person's entry is replaced wholesale by the latest assignment or
/// release, so the entry depends only on the latest event for that person.
/// A release clears roles and assignment.
#[derive(Debug, Default, Copy, Clone)]
pub struct RosterProjection;

impl RosterProjection {
    pub const NAME: &'static str = "roster";
}

impl Projection for RosterProjection {
    type State = BTreeMap<String, RosterEntry>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn handles(&self, event_type: EventType) -> bool {
        matches!(event_type, EventType::PersonAssigned | EventType::PersonReleased)
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        let version = LwwVersion::of(event);
        let (person_id, entry) = match &event.payload {
            EventPayload::PersonAssigned(p) => (
                &p.person_id,
                RosterEntry {
                    roles: p.roles.iter().cloned().collect(),
                    assignment: Some(p.assignment.clone()),
                    active: true,
                    version,
                },
            ),
            EventPayload::PersonReleased(p) => (
                &p.person_id,
                RosterEntry {
                    roles: BTreeSet::new(),
                    assignment: None,
                    active: false,
                    version,
                },
            ),
            _ => return state,
        };
        if state.get(person_id).is_none_or(|current| version > current.version) {
            state.insert(person_id.clone(), entry);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{event_at, reversed};
    use opsync_events::{PersonAssigned, PersonReleased, ProjectionRunner};

    fn assigned(person: &str, roles: &[&str], millis: u64) -> Event {
        event_at(
            EventPayload::PersonAssigned(PersonAssigned {
                person_id: person.to_string(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                assignment: "shelter-3".to_string(),
            }),
            millis,
        )
    }

    fn released(person: &str, millis: u64) -> Event {
        event_at(
            EventPayload::PersonReleased(PersonReleased {
                person_id: person.to_string(),
            }),
            millis,
        )
    }

    #[test]
    fn latest_assignment_replaces_roles() {
        let events = vec![assigned("p1", &["driver"], 10), assigned("p1", &["medic", "driver"], 20)];
        let runner = ProjectionRunner::rebuild_from_scratch(RosterProjection, &events).unwrap();
        let entry = &runner.state()["p1"];
        assert!(entry.active);
        assert_eq!(entry.roles.iter().map(String::as_str).collect::<Vec<_>>(), vec!["driver", "medic"]);
    }

    #[test]
    fn release_is_order_independent() {
        let events = vec![assigned("p1", &["driver"], 10), released("p1", 20)];
        let forward = ProjectionRunner::rebuild_from_scratch(RosterProjection, &events).unwrap();
        let backward = ProjectionRunner::rebuild_from_scratch(RosterProjection, reversed(&events)).unwrap();
        assert_eq!(forward.state(), backward.state());
        let entry = &forward.state()["p1"];
        assert!(!entry.active);
        assert!(entry.roles.is_empty());
        assert_eq!(entry.assignment, None);
    }
}
