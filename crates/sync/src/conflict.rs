//! Conflict detection and resolution policies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use opsync_core::{ConflictId, Timestamp};
use opsync_events::{
    EntityKey, Event, EventPayload, EventType, PersonAssigned, RegisterValue, ResolutionStrategy, SectionEdited,
};

use crate::change::ChangeDetector;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("resolver `{resolver}` cannot merge {event_type} events")]
    Unsupported {
        resolver: &'static str,
        event_type: EventType,
    },

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("unknown conflict {0}")]
    UnknownConflict(ConflictId),

    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),
}

/// Pluggable merge for the domain-specific policy.
///
/// `merge` must be deterministic and symmetric (`merge(a, b) == merge(b, a)`)
/// so both replicas of a conflict arrive at the same payload.
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, local: &Event, remote: &Event) -> Result<EventPayload, ConflictError>;
}

/// How conflicting writes of one event type are settled.
#[derive(Clone)]
pub enum ConflictPolicy {
    LastWriteWins,
    FirstWriteWins,
    /// Both writes are kept; the projection combines them.
    CrdtMerge,
    DomainSpecific(Arc<dyn ConflictResolver>),
    /// Escalate as a `ConflictDetected` event and apply nothing.
    Manual,
}

impl ConflictPolicy {
    pub fn domain_specific(resolver: impl ConflictResolver + 'static) -> Self {
        ConflictPolicy::DomainSpecific(Arc::new(resolver))
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        match self {
            ConflictPolicy::LastWriteWins => ResolutionStrategy::LastWriteWins,
            ConflictPolicy::FirstWriteWins => ResolutionStrategy::FirstWriteWins,
            ConflictPolicy::CrdtMerge => ResolutionStrategy::CrdtMerge,
            ConflictPolicy::DomainSpecific(_) => ResolutionStrategy::DomainSpecific,
            ConflictPolicy::Manual => ResolutionStrategy::Manual,
        }
    }
}

impl core::fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConflictPolicy::DomainSpecific(resolver) => write!(f, "DomainSpecific({})", resolver.name()),
            other => write!(f, "{}", other.strategy()),
        }
    }
}

/// Extracts the entity an event writes to.
pub type KeyExtractor = fn(&EventPayload) -> Option<EntityKey>;

/// Per-type conflict policies and key extractors.
///
/// Counters default to CRDT merge; every other type defaults to
/// last-write-wins.
#[derive(Debug, Clone)]
pub struct ConflictPolicies {
    default: ConflictPolicy,
    by_type: HashMap<EventType, ConflictPolicy>,
    extractors: HashMap<EventType, KeyExtractor>,
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        Self {
            default: ConflictPolicy::LastWriteWins,
            by_type: HashMap::from([(EventType::CounterIncremented, ConflictPolicy::CrdtMerge)]),
            extractors: HashMap::new(),
        }
    }
}

impl ConflictPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, event_type: EventType, policy: ConflictPolicy) -> Self {
        self.by_type.insert(event_type, policy);
        self
    }

    /// Policy for types without their own entry.
    pub fn with_default(mut self, policy: ConflictPolicy) -> Self {
        self.default = policy;
        self
    }

    /// Replace the built-in conflict key for one type.
    pub fn with_key_extractor(mut self, event_type: EventType, extractor: KeyExtractor) -> Self {
        self.extractors.insert(event_type, extractor);
        self
    }

    pub fn policy_for(&self, event_type: EventType) -> &ConflictPolicy {
        self.by_type.get(&event_type).unwrap_or(&self.default)
    }

    pub fn conflict_key(&self, event: &Event) -> Option<EntityKey> {
        match self.extractors.get(&event.event_type) {
            Some(extract) => extract(&event.payload),
            None => event.payload.conflict_key(),
        }
    }

    /// [`is_conflict`] using this table's key extractors.
    pub fn is_conflict(&self, local: &Event, remote: &Event, window: Duration) -> bool {
        conflicts_on(local, remote, window, self.conflict_key(local), self.conflict_key(remote))
    }
}

/// Whether two writes diverge on the same entity.
///
/// False for the same actor, different types, different (or absent) conflict
/// keys, timestamps further apart than `window`, or when one event caused the
/// other.
pub fn is_conflict(local: &Event, remote: &Event, window: Duration) -> bool {
    conflicts_on(
        local,
        remote,
        window,
        local.payload.conflict_key(),
        remote.payload.conflict_key(),
    )
}

fn conflicts_on(
    local: &Event,
    remote: &Event,
    window: Duration,
    local_key: Option<EntityKey>,
    remote_key: Option<EntityKey>,
) -> bool {
    if local.actor_id == remote.actor_id || local.event_type != remote.event_type {
        return false;
    }
    if local.causation_id == Some(remote.id) || remote.causation_id == Some(local.id) {
        return false;
    }
    let (Some(a), Some(b)) = (local_key, remote_key) else {
        return false;
    };
    a == b && within_window(local.timestamp, remote.timestamp, window)
}

fn within_window(a: Timestamp, b: Timestamp, window: Duration) -> bool {
    u128::from(a.distance(b)) <= window.as_millis()
}

/// Unions role lists of concurrent `PersonAssigned` writes.
///
/// The assignment comes from the later write.
#[derive(Debug, Default, Copy, Clone)]
pub struct RoleUnionResolver;

impl ConflictResolver for RoleUnionResolver {
    fn name(&self) -> &'static str {
        "role_union"
    }

    fn merge(&self, local: &Event, remote: &Event) -> Result<EventPayload, ConflictError> {
        let (EventPayload::PersonAssigned(a), EventPayload::PersonAssigned(b)) = (&local.payload, &remote.payload)
        else {
            return Err(ConflictError::Unsupported {
                resolver: self.name(),
                event_type: remote.event_type,
            });
        };
        let later = if remote.is_later_than(local) { b } else { a };
        let roles: BTreeSet<&String> = a.roles.iter().chain(b.roles.iter()).collect();
        Ok(EventPayload::PersonAssigned(PersonAssigned {
            person_id: later.person_id.clone(),
            roles: roles.into_iter().cloned().collect(),
            assignment: later.assignment.clone(),
        }))
    }
}

/// Field-level merge of concurrent `SectionEdited` writes.
///
/// Fields edited on only one side are kept; a field edited on both sides
/// takes the later write.
#[derive(Debug)]
pub struct SectionMergeResolver {
    detector: ChangeDetector,
}

impl Default for SectionMergeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionMergeResolver {
    pub fn new() -> Self {
        Self {
            detector: ChangeDetector::without_ignored_fields(),
        }
    }
}

impl ConflictResolver for SectionMergeResolver {
    fn name(&self) -> &'static str {
        "section_merge"
    }

    fn merge(&self, local: &Event, remote: &Event) -> Result<EventPayload, ConflictError> {
        let (EventPayload::SectionEdited(a), EventPayload::SectionEdited(b)) = (&local.payload, &remote.payload)
        else {
            return Err(ConflictError::Unsupported {
                resolver: self.name(),
                event_type: remote.event_type,
            });
        };
        let empty = Value::Object(serde_json::Map::new());
        let as_record =
            |fields: &BTreeMap<String, RegisterValue>| serde_json::to_value(fields).map_err(|e| ConflictError::Merge(e.to_string()));

        let ours = self.detector.detect_changes(&empty, &as_record(&a.fields)?, local.actor_id, local.timestamp);
        let theirs = self.detector.detect_changes(&empty, &as_record(&b.fields)?, remote.actor_id, remote.timestamp);
        let merged = self.detector.merge_changes(&empty, &[ours, theirs]);

        let fields: BTreeMap<String, RegisterValue> =
            serde_json::from_value(merged).map_err(|e| ConflictError::Merge(e.to_string()))?;
        Ok(EventPayload::SectionEdited(SectionEdited {
            document_id: b.document_id.clone(),
            section: b.section.clone(),
            fields,
        }))
    }
}
