use std::collections::BTreeMap;

use opsync_events::{Event, EventPayload, EventType, Projection};

/// CRDT counter: per-key sum of `CounterIncremented` amounts.
///
/// Addition commutes, so late and out-of-order deliveries converge.
#[derive(Debug, Default, Copy, Clone)]
pub struct CountersProjection;

impl CountersProjection {
    pub const NAME: &'static str = "counters";
}

impl Projection for CountersProjection {
    type State = BTreeMap<String, i64>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::CounterIncremented
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        if let EventPayload::CounterIncremented(p) = &event.payload {
            let total = state.entry(p.key.clone()).or_insert(0);
            // wrapping keeps the sum order independent even at the edges
            *total = total.wrapping_add(p.amount);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{counter, reversed};
    use opsync_events::ProjectionRunner;
    use proptest::prelude::*;

    #[test]
    fn out_of_order_increments_sum() {
        let events = vec![counter("K", 3, 20), counter("K", 5, 10), counter("other", 1, 5)];
        let runner = ProjectionRunner::rebuild_from_scratch(CountersProjection, &events).unwrap();
        assert_eq!(runner.state().get("K"), Some(&8));
        assert_eq!(runner.state().get("other"), Some(&1));
    }

    proptest! {
        #[test]
        fn increments_commute(a in -1_000i64..1_000, b in -1_000i64..1_000) {
            prop_assume!(a != 0 && b != 0);
            let events = vec![counter("K", a, 1), counter("K", b, 2)];
            let forward = ProjectionRunner::rebuild_from_scratch(CountersProjection, &events).unwrap();
            let backward = ProjectionRunner::rebuild_from_scratch(CountersProjection, reversed(&events)).unwrap();
            prop_assert_eq!(forward.state().get("K"), Some(&(a + b)));
            prop_assert_eq!(forward.state(), backward.state());
        }
    }
}
