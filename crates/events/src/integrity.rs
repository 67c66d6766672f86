//! Event digests and the per-device hash chain.
//!
//! The digest covers everything that makes an event what it is (identity,
//! provenance, ordering, causality, payload, chain link) and nothing that
//! changes as it moves through the outbox.

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use opsync_core::{
    ActorId, CorrelationId, DeviceId, EventId, OperationId, SessionId, Timestamp,
};

use crate::event::Event;
use crate::payload::{EventPayload, EventType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("event {event_id} has no hash")]
    Unsealed { event_id: EventId },

    #[error("event {event_id} hash mismatch (stored {stored}, computed {computed})")]
    DigestMismatch {
        event_id: EventId,
        stored: String,
        computed: String,
    },

    #[error("event {event_id} links to {found:?}, expected {expected:?}")]
    BrokenLink {
        event_id: EventId,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("failed to encode event {event_id}: {message}")]
    Encoding { event_id: EventId, message: String },
}

#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a EventId,
    event_type: &'a EventType,
    schema_version: u32,
    actor_id: &'a ActorId,
    device_id: &'a DeviceId,
    session_id: &'a SessionId,
    operation_id: &'a Option<OperationId>,
    timestamp: &'a Timestamp,
    sequence: &'a Option<u32>,
    payload: &'a EventPayload,
    causation_id: &'a Option<EventId>,
    correlation_id: &'a CorrelationId,
    previous_hash: &'a Option<String>,
}

/// Hex-encoded SHA-256 over the event's canonical fields.
pub fn compute_hash(event: &Event) -> Result<String, ChainError> {
    let canonical = Canonical {
        id: &event.id,
        event_type: &event.event_type,
        schema_version: event.schema_version,
        actor_id: &event.actor_id,
        device_id: &event.device_id,
        session_id: &event.session_id,
        operation_id: &event.operation_id,
        timestamp: &event.timestamp,
        sequence: &event.sequence,
        payload: &event.payload,
        causation_id: &event.causation_id,
        correlation_id: &event.correlation_id,
        previous_hash: &event.previous_hash,
    };
    let bytes = serde_json::to_vec(&canonical).map_err(|e| ChainError::Encoding {
        event_id: event.id,
        message: e.to_string(),
    })?;
    Ok(to_hex(&Sha256::digest(&bytes)))
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn digest_bytes(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Link `event` after `previous_hash` and stamp its digest.
pub fn seal(event: &mut Event, previous_hash: Option<String>) -> Result<(), ChainError> {
    event.previous_hash = previous_hash;
    event.hash = Some(compute_hash(event)?);
    Ok(())
}

/// Check a single event's stored digest.
pub fn verify(event: &Event) -> Result<(), ChainError> {
    let stored = event
        .hash
        .as_ref()
        .ok_or(ChainError::Unsealed { event_id: event.id })?;
    let computed = compute_hash(event)?;
    if *stored != computed {
        return Err(ChainError::DigestMismatch {
            event_id: event.id,
            stored: stored.clone(),
            computed,
        });
    }
    Ok(())
}

/// Verify a device's events, given in emission order.
///
/// Returns the first event whose digest or link is wrong.
pub fn verify_chain<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<(), ChainError> {
    let mut expected: Option<String> = None;
    let mut first = true;
    for event in events {
        verify(event)?;
        if !first && event.previous_hash != expected {
            return Err(ChainError::BrokenLink {
                event_id: event.id,
                expected,
                found: event.previous_hash.clone(),
            });
        }
        first = false;
        expected = event.hash.clone();
    }
    Ok(())
}
