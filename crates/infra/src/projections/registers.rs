use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use opsync_events::{Event, EventPayload, EventType, Projection, RegisterValue};

use super::LwwVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub value: RegisterValue,
    pub version: LwwVersion,
}

/// Last-write-wins register per key.
#[derive(Debug, Default, Copy, Clone)]
pub struct RegistersProjection;

impl RegistersProjection {
    pub const NAME: &'static str = "registers";
}

impl Projection for RegistersProjection {
    type State = BTreeMap<String, RegisterEntry>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::RegisterSet
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        let EventPayload::RegisterSet(p) = &event.payload else {
            return state;
        };
        let version = LwwVersion::of(event);
        let newer = state.get(&p.key).is_none_or(|current| version > current.version);
        if newer {
            state.insert(
                p.key.clone(),
                RegisterEntry {
                    value: p.value.clone(),
                    version,
                },
            );
        }
        state
    }
}
