use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use opsync_events::{Event, EventPayload, EventType, Projection};

use super::LwwVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountyStatus {
    pub status: String,
    pub version: LwwVersion,
}

/// Latest reported status per county.
#[derive(Debug, Default, Copy, Clone)]
pub struct CountyStatusProjection;

impl CountyStatusProjection {
    pub const NAME: &'static str = "county_status";
}

impl Projection for CountyStatusProjection {
    type State = BTreeMap<String, CountyStatus>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::CountyStatusSet
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        let EventPayload::CountyStatusSet(p) = &event.payload else {
            return state;
        };
        let version = LwwVersion::of(event);
        if state.get(&p.county_id).is_none_or(|current| version > current.version) {
            state.insert(
                p.county_id.clone(),
                CountyStatus {
                    status: p.status.clone(),
                    version,
                },
            );
        }
        state
    }
}
