//! `opsync-events`: the event model and its in-process mechanics.
//!
//! - typed events and payloads (`Event`, `EventPayload`, `EventType`)
//! - digests and the per-device hash chain
//! - the subscriber registry behind `on` / `on_all` / `on_many` / `once`
//! - the `Projection` abstraction and an idempotent runner
//!
//! Nothing here performs I/O; storage and delivery live in `opsync-infra`
//! and `opsync-sync`.

pub mod bus;
pub mod event;
pub mod integrity;
pub mod payload;
pub mod projection;
pub mod runner;

pub use bus::{DispatchOutcome, EventFilter, HandlerError, RegistryStats, SubscriberRegistry, Subscription};
pub use event::{DeliveryStatus, Event, EventMetadata};
pub use integrity::{ChainError, compute_hash, seal, verify, verify_chain};
pub use payload::{
    ConflictDetected, ConflictResolved, CounterIncremented, CountyStatusSet, EntityKey, EventPayload,
    EventType, PersonAssigned, PersonReleased, RegisterSet, RegisterValue, ResolutionStrategy,
    SectionEdited, ValidationError,
};
pub use projection::Projection;
pub use runner::{Applied, Checkpoint, ProjectionError, ProjectionRunner};
