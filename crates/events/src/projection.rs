use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::Event;
use crate::payload::EventType;

/// A read model folded from the event stream.
///
/// A projection is a description, not a container: it names the read model,
/// supplies the initial state and folds one event into a state. The
/// [`ProjectionRunner`](crate::ProjectionRunner) owns the state and tracks
/// which events have been applied.
///
/// ## Determinism
///
/// `fold` must be a pure function of `(state, event)`. No I/O, no wall-clock
/// reads (use `event.timestamp`), no randomness. Rebuilding from the same
/// events must produce the same state.
///
/// ## Order independence
///
/// Events from other devices arrive late and out of order. Folds should be
/// written so the result does not depend on application order: sum for
/// counters, compare `Event::ordering_key` for last-write-wins values.
/// Duplicates are filtered by the runner before `fold` is called.
pub trait Projection: Send + Sync + 'static {
    type State: Clone + PartialEq + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable name; also the snapshot key.
    fn name(&self) -> &'static str;

    fn initial_state(&self) -> Self::State;

    /// Event types this projection folds; others are skipped without a call to `fold`.
    fn handles(&self, event_type: EventType) -> bool;

    fn fold(&self, state: Self::State, event: &Event) -> Self::State;
}
