//! `opsync-core`: identity and time primitives for the sync substrate.
//!
//! This crate contains **pure** primitives (no storage, no transport).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{DeviceClock, Stamp, Timestamp};
pub use error::{DomainError, DomainResult};
pub use id::{ActorId, ConflictId, CorrelationId, DeviceId, EventId, OperationId, SessionId};
