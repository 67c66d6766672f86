//! Infrastructure layer: event storage, the emitting bus and projections.
//!
//! - `event_store`: the `EventStore` port with in-memory and SQLite adapters,
//!   outbox/inbox/snapshot records and the retry policy
//! - `event_bus`: validate, seal, append, then fan out to subscribers
//! - `projections`: built-in read models and the `ProjectionManager`

pub mod event_bus;
pub mod event_store;
pub mod projections;
