//! Projection runner (state ownership + idempotent application).
//!
//! Read models are **disposable**; events are the source of truth.
//! The runner dedupes by event id instead of a monotonic sequence, since
//! events from other devices arrive after newer local ones.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use opsync_core::{EventId, OperationId};

use crate::event::Event;
use crate::projection::Projection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("event {event_id} belongs to operation {found:?}, runner is pinned to {expected}")]
    OperationMismatch {
        event_id: EventId,
        expected: OperationId,
        found: Option<OperationId>,
    },

    #[error("unknown projection `{0}`")]
    UnknownProjection(String),

    #[error("projection `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("projection `{name}` state type mismatch")]
    StateType { name: String },

    #[error("projection `{name}`: failed to encode state: {message}")]
    Encoding { name: String, message: String },

    #[error("projection `{name}`: snapshot rejected: {reason}")]
    Snapshot { name: String, reason: String },

    #[error("projection `{name}`: store error: {message}")]
    Store { name: String, message: String },
}

/// Outcome of offering one event to a runner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Folded,
    /// Already applied (same id).
    Duplicate,
    /// The projection does not handle this type.
    Ignored,
}

/// Serializable runner state, used for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub state: S,
    /// Sorted so equal checkpoints serialize identically.
    pub applied: Vec<EventId>,
}

/// Owns a projection's state and folds events into it exactly once.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    state: P::State,
    applied: HashSet<EventId>,
    operation: Option<OperationId>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        let state = projection.initial_state();
        Self {
            projection,
            state,
            applied: HashSet::new(),
            operation: None,
        }
    }

    /// Create a runner pinned to one operation.
    ///
    /// Events from any other operation are rejected instead of silently
    /// mixing two operations' read models.
    pub fn new_for_operation(operation_id: OperationId, projection: P) -> Self {
        let mut runner = Self::new(projection);
        runner.operation = Some(operation_id);
        runner
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn state(&self) -> &P::State {
        &self.state
    }

    pub fn operation(&self) -> Option<OperationId> {
        self.operation
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn has_applied(&self, event_id: &EventId) -> bool {
        self.applied.contains(event_id)
    }

    pub fn apply(&mut self, event: &Event) -> Result<Applied, ProjectionError> {
        if let Some(expected) = self.operation {
            if event.operation_id != Some(expected) {
                return Err(ProjectionError::OperationMismatch {
                    event_id: event.id,
                    expected,
                    found: event.operation_id,
                });
            }
        }
        if !self.projection.handles(event.event_type) {
            return Ok(Applied::Ignored);
        }
        if !self.applied.insert(event.id) {
            return Ok(Applied::Duplicate);
        }
        let state = std::mem::replace(&mut self.state, self.projection.initial_state());
        self.state = self.projection.fold(state, event);
        Ok(Applied::Folded)
    }

    /// Apply many events in the given order.
    pub fn run<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> Result<usize, ProjectionError> {
        let mut folded = 0;
        for event in events {
            if self.apply(event)? == Applied::Folded {
                folded += 1;
            }
        }
        Ok(folded)
    }

    /// Drop all state and start over from the initial state.
    pub fn reset(&mut self) {
        self.state = self.projection.initial_state();
        self.applied.clear();
    }

    pub fn checkpoint(&self) -> Checkpoint<P::State> {
        let mut applied: Vec<EventId> = self.applied.iter().copied().collect();
        applied.sort();
        Checkpoint {
            state: self.state.clone(),
            applied,
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint<P::State>) {
        self.state = checkpoint.state;
        self.applied = checkpoint.applied.into_iter().collect();
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a>(
        projection: P,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<Self, ProjectionError> {
        let mut runner = ProjectionRunner::new(projection);
        runner.run(events)?;
        Ok(runner)
    }
}
