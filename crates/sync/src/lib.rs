//! Offline-first sync for field operations.
//!
//! A [`Replica`] owns a local event log, the projections built from it and a
//! [`SyncEngine`] that exchanges events with a remote peer. Writes always
//! succeed locally; delivery happens when connectivity allows, and
//! concurrent writes to the same entity are settled by per-type
//! [`ConflictPolicy`]s.

pub mod change;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod http;
pub mod offline;
pub mod replica;
pub mod transport;
pub mod worker;

pub use change::{
    ChangeDetector, ChangeError, ChangeSet, FieldChange, FieldPath, FieldValidator, IntegerRange, NonEmptyText, OneOf,
};
pub use config::SyncConfig;
pub use conflict::{
    ConflictError, ConflictPolicies, ConflictPolicy, ConflictResolver, RoleUnionResolver, SectionMergeResolver,
    is_conflict,
};
pub use engine::{
    InboundOutcome, ManualResolution, SkipReason, SyncEngine, SyncError, SyncPhase, SyncReport, SyncStatus,
};
pub use http::HttpRemote;
pub use offline::{Connectivity, ConnectivityState};
pub use replica::{Replica, ReplicaBuilder};
pub use transport::{FetchBatch, InMemoryRemote, RemotePeer, TransportError};
pub use worker::{SyncWorker, SyncWorkerHandle};
