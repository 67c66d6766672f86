use serde::{Deserialize, Serialize};

use opsync_core::{
    ActorId, CorrelationId, DeviceId, EventId, OperationId, SessionId, Stamp, Timestamp,
};

use crate::payload::{EventPayload, EventType, ValidationError};

/// Delivery state of an event relative to the remote peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Recorded locally, not queued for delivery.
    #[default]
    Local,
    Pending,
    Synced,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Local => "local",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Synced => "synced",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(DeliveryStatus::Local),
            "pending" => Some(DeliveryStatus::Pending),
            "synced" => Some(DeliveryStatus::Synced),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Who recorded an event, from where, and what it relates to.
///
/// Callers pass this to `emit`; the bus fills in identity, ordering and
/// integrity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub actor_id: ActorId,
    pub device_id: DeviceId,
    pub session_id: SessionId,
    pub operation_id: Option<OperationId>,
    pub causation_id: Option<EventId>,
    /// Generated when absent.
    pub correlation_id: Option<CorrelationId>,
}

impl EventMetadata {
    pub fn new(actor_id: ActorId, device_id: DeviceId, session_id: SessionId) -> Self {
        Self {
            actor_id,
            device_id,
            session_id,
            operation_id: None,
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn with_operation(mut self, operation_id: OperationId) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn caused_by(mut self, event: &Event) -> Self {
        self.causation_id = Some(event.id);
        self.correlation_id = Some(event.correlation_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Immutable record of a single state change.
///
/// Serialized with this exact shape both in storage and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub schema_version: u32,

    pub actor_id: ActorId,
    pub device_id: DeviceId,
    pub session_id: SessionId,
    pub operation_id: Option<OperationId>,

    pub timestamp: Timestamp,
    pub sequence: Option<u32>,

    pub payload: EventPayload,

    pub causation_id: Option<EventId>,
    pub correlation_id: CorrelationId,

    pub hash: Option<String>,
    pub previous_hash: Option<String>,

    #[serde(default)]
    pub sync_status: DeliveryStatus,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub sync_error: Option<String>,
}

impl Event {
    /// Build an unsealed event from caller metadata and a clock stamp.
    pub fn new(metadata: EventMetadata, stamp: Stamp, payload: EventPayload) -> Self {
        let event_type = payload.event_type();
        Self {
            id: EventId::new(),
            event_type,
            schema_version: event_type.schema_version(),
            actor_id: metadata.actor_id,
            device_id: metadata.device_id,
            session_id: metadata.session_id,
            operation_id: metadata.operation_id,
            timestamp: stamp.timestamp,
            sequence: Some(stamp.sequence),
            payload,
            causation_id: metadata.causation_id,
            correlation_id: metadata.correlation_id.unwrap_or_default(),
            hash: None,
            previous_hash: None,
            sync_status: DeliveryStatus::Local,
            sync_attempts: 0,
            sync_error: None,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.timestamp, self.sequence.unwrap_or(0))
    }

    /// Total order used for replay and last-write-wins decisions.
    pub fn ordering_key(&self) -> (Timestamp, u32, EventId) {
        (self.timestamp, self.sequence.unwrap_or(0), self.id)
    }

    /// Whether `self` sorts after `other` under [`Event::ordering_key`].
    pub fn is_later_than(&self, other: &Event) -> bool {
        self.ordering_key() > other.ordering_key()
    }

    /// Structural validation: declared type, schema version, and payload shape.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let actual = self.payload.event_type();
        if self.event_type != actual {
            return Err(ValidationError::TypeMismatch {
                declared: self.event_type,
                actual,
            });
        }
        if self.schema_version != actual.schema_version() {
            return Err(ValidationError::UnsupportedSchemaVersion {
                event_type: actual,
                version: self.schema_version,
            });
        }
        self.payload.validate()
    }

    pub fn in_operation(&self, operation_id: Option<OperationId>) -> bool {
        match operation_id {
            None => true,
            Some(op) => self.operation_id == Some(op),
        }
    }
}
