//! Typed event payloads.
//!
//! Every event carries exactly one `EventPayload` variant. The variant is the
//! event's type: there is no free-form payload. Each variant validates its own
//! shape and declares which logical entity it writes to (its conflict key).

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use opsync_core::{ConflictId, EventId};

use crate::event::Event;

/// Payload validation failure (rejected before any durable write).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{event_type}: field `{field}` must not be empty")]
    EmptyField { event_type: EventType, field: &'static str },

    #[error("{event_type}: field `{field}` is invalid: {reason}")]
    InvalidField {
        event_type: EventType,
        field: &'static str,
        reason: String,
    },

    #[error("declared type `{declared}` does not match payload type `{actual}`")]
    TypeMismatch { declared: EventType, actual: EventType },

    #[error("{event_type}: unsupported schema version {version}")]
    UnsupportedSchemaVersion { event_type: EventType, version: u32 },

    #[error("unknown event type `{0}`")]
    UnknownType(String),
}

/// Discriminator of an event payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "counter.incremented")]
    CounterIncremented,
    #[serde(rename = "register.set")]
    RegisterSet,
    #[serde(rename = "roster.person_assigned")]
    PersonAssigned,
    #[serde(rename = "roster.person_released")]
    PersonReleased,
    #[serde(rename = "document.section_edited")]
    SectionEdited,
    #[serde(rename = "county.status_set")]
    CountyStatusSet,
    #[serde(rename = "sync.conflict_detected")]
    ConflictDetected,
    #[serde(rename = "sync.conflict_resolved")]
    ConflictResolved,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::CounterIncremented,
        EventType::RegisterSet,
        EventType::PersonAssigned,
        EventType::PersonReleased,
        EventType::SectionEdited,
        EventType::CountyStatusSet,
        EventType::ConflictDetected,
        EventType::ConflictResolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CounterIncremented => "counter.incremented",
            EventType::RegisterSet => "register.set",
            EventType::PersonAssigned => "roster.person_assigned",
            EventType::PersonReleased => "roster.person_released",
            EventType::SectionEdited => "document.section_edited",
            EventType::CountyStatusSet => "county.status_set",
            EventType::ConflictDetected => "sync.conflict_detected",
            EventType::ConflictResolved => "sync.conflict_resolved",
        }
    }

    /// Current schema version written for this type.
    pub fn schema_version(&self) -> u32 {
        1
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownType(s.to_string()))
    }
}

/// Scalar value held by registers and document fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<i64> for RegisterValue {
    fn from(value: i64) -> Self {
        RegisterValue::Int(value)
    }
}

impl From<bool> for RegisterValue {
    fn from(value: bool) -> Self {
        RegisterValue::Bool(value)
    }
}

impl From<&str> for RegisterValue {
    fn from(value: &str) -> Self {
        RegisterValue::Text(value.to_string())
    }
}

impl From<String> for RegisterValue {
    fn from(value: String) -> Self {
        RegisterValue::Text(value)
    }
}

/// Logical entity an event writes to.
///
/// Two events conflict only if they carry equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(kind: &str, id: &str) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a conflict was (or is to be) settled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    FirstWriteWins,
    CrdtMerge,
    DomainSpecific,
    Manual,
}

impl core::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::FirstWriteWins => "first_write_wins",
            ResolutionStrategy::CrdtMerge => "crdt_merge",
            ResolutionStrategy::DomainSpecific => "domain_specific",
            ResolutionStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIncremented {
    pub key: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    pub key: String,
    pub value: RegisterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonAssigned {
    pub person_id: String,
    pub roles: Vec<String>,
    /// Where the person is assigned (site, shelter, district...).
    pub assignment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonReleased {
    pub person_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEdited {
    pub document_id: String,
    pub section: String,
    pub fields: BTreeMap<String, RegisterValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountyStatusSet {
    pub county_id: String,
    pub status: String,
}

/// Two divergent writes escalated for a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetected {
    pub conflict_id: ConflictId,
    pub entity: EntityKey,
    pub local: Box<Event>,
    pub remote: Box<Event>,
}

/// Record of how a conflict was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolved {
    /// Set when this closes an escalated (manual) conflict.
    pub conflict_id: Option<ConflictId>,
    pub entity: EntityKey,
    pub strategy: ResolutionStrategy,
    /// Event whose write was kept as-is.
    pub winner: Option<EventId>,
    /// Events whose writes were dropped.
    pub discarded: Vec<EventId>,
    /// Event emitted to carry a merged write.
    pub merged: Option<EventId>,
}

/// Schema-tagged payload union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "counter.incremented")]
    CounterIncremented(CounterIncremented),
    #[serde(rename = "register.set")]
    RegisterSet(RegisterSet),
    #[serde(rename = "roster.person_assigned")]
    PersonAssigned(PersonAssigned),
    #[serde(rename = "roster.person_released")]
    PersonReleased(PersonReleased),
    #[serde(rename = "document.section_edited")]
    SectionEdited(SectionEdited),
    #[serde(rename = "county.status_set")]
    CountyStatusSet(CountyStatusSet),
    #[serde(rename = "sync.conflict_detected")]
    ConflictDetected(ConflictDetected),
    #[serde(rename = "sync.conflict_resolved")]
    ConflictResolved(ConflictResolved),
}

fn require(event_type: EventType, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { event_type, field });
    }
    Ok(())
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::CounterIncremented(_) => EventType::CounterIncremented,
            EventPayload::RegisterSet(_) => EventType::RegisterSet,
            EventPayload::PersonAssigned(_) => EventType::PersonAssigned,
            EventPayload::PersonReleased(_) => EventType::PersonReleased,
            EventPayload::SectionEdited(_) => EventType::SectionEdited,
            EventPayload::CountyStatusSet(_) => EventType::CountyStatusSet,
            EventPayload::ConflictDetected(_) => EventType::ConflictDetected,
            EventPayload::ConflictResolved(_) => EventType::ConflictResolved,
        }
    }

    /// Check the payload against its type's schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let t = self.event_type();
        match self {
            EventPayload::CounterIncremented(p) => {
                require(t, "key", &p.key)?;
                if p.amount == 0 {
                    return Err(ValidationError::InvalidField {
                        event_type: t,
                        field: "amount",
                        reason: "must be non-zero".to_string(),
                    });
                }
            }
            EventPayload::RegisterSet(p) => {
                require(t, "key", &p.key)?;
            }
            EventPayload::PersonAssigned(p) => {
                require(t, "person_id", &p.person_id)?;
                require(t, "assignment", &p.assignment)?;
                if p.roles.is_empty() {
                    return Err(ValidationError::EmptyField { event_type: t, field: "roles" });
                }
                for role in &p.roles {
                    require(t, "roles", role)?;
                }
            }
            EventPayload::PersonReleased(p) => {
                require(t, "person_id", &p.person_id)?;
            }
            EventPayload::SectionEdited(p) => {
                require(t, "document_id", &p.document_id)?;
                require(t, "section", &p.section)?;
                if p.fields.is_empty() {
                    return Err(ValidationError::EmptyField { event_type: t, field: "fields" });
                }
                for name in p.fields.keys() {
                    require(t, "fields", name)?;
                }
            }
            EventPayload::CountyStatusSet(p) => {
                require(t, "county_id", &p.county_id)?;
                require(t, "status", &p.status)?;
            }
            EventPayload::ConflictDetected(p) => {
                if p.local.id == p.remote.id {
                    return Err(ValidationError::InvalidField {
                        event_type: t,
                        field: "remote",
                        reason: "local and remote must be distinct events".to_string(),
                    });
                }
                if p.local.event_type != p.remote.event_type {
                    return Err(ValidationError::InvalidField {
                        event_type: t,
                        field: "remote",
                        reason: format!(
                            "local is `{}` but remote is `{}`",
                            p.local.event_type, p.remote.event_type
                        ),
                    });
                }
            }
            EventPayload::ConflictResolved(p) => {
                if p.winner.is_none() && p.merged.is_none() && p.discarded.is_empty() {
                    return Err(ValidationError::InvalidField {
                        event_type: t,
                        field: "winner",
                        reason: "a resolution must keep, merge or discard something".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Entity this payload writes to; `None` means it never conflicts.
    pub fn conflict_key(&self) -> Option<EntityKey> {
        match self {
            EventPayload::CounterIncremented(p) => Some(EntityKey::new("counter", &p.key)),
            EventPayload::RegisterSet(p) => Some(EntityKey::new("register", &p.key)),
            EventPayload::PersonAssigned(p) => Some(EntityKey::new("person", &p.person_id)),
            EventPayload::PersonReleased(p) => Some(EntityKey::new("person", &p.person_id)),
            EventPayload::SectionEdited(p) => Some(EntityKey::new(
                "section",
                &format!("{}/{}", p.document_id, p.section),
            )),
            EventPayload::CountyStatusSet(p) => Some(EntityKey::new("county", &p.county_id)),
            EventPayload::ConflictDetected(_) | EventPayload::ConflictResolved(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn payload_is_tagged_with_its_type() {
        let payload = EventPayload::CounterIncremented(CounterIncremented {
            key: "meals".to_string(),
            amount: 5,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "counter.incremented");
        assert_eq!(json["data"]["amount"], 5);
    }

    #[test]
    fn rejects_zero_increment() {
        let payload = EventPayload::CounterIncremented(CounterIncremented {
            key: "meals".to_string(),
            amount: 0,
        });
        assert!(matches!(
            payload.validate(),
            Err(ValidationError::InvalidField { field: "amount", .. })
        ));
    }

    #[test]
    fn rejects_assignment_without_roles() {
        let payload = EventPayload::PersonAssigned(PersonAssigned {
            person_id: "p-1".to_string(),
            roles: vec![],
            assignment: "shelter-3".to_string(),
        });
        assert!(matches!(
            payload.validate(),
            Err(ValidationError::EmptyField { field: "roles", .. })
        ));
    }

    #[test]
    fn assign_and_release_share_a_conflict_key() {
        let assigned = EventPayload::PersonAssigned(PersonAssigned {
            person_id: "p-1".to_string(),
            roles: vec!["driver".to_string()],
            assignment: "district-2".to_string(),
        });
        let released = EventPayload::PersonReleased(PersonReleased {
            person_id: "p-1".to_string(),
        });
        assert_eq!(assigned.conflict_key(), released.conflict_key());
    }

    #[test]
    fn register_values_serialize_untagged() {
        assert_eq!(serde_json::to_value(RegisterValue::Int(7)).unwrap(), 7);
        assert_eq!(serde_json::to_value(RegisterValue::from("open")).unwrap(), "open");
        let back: RegisterValue = serde_json::from_str("true").unwrap();
        assert_eq!(back, RegisterValue::Bool(true));
    }
}
