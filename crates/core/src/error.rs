//! Errors raised by the core primitives.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Malformed primitive values. Storage, transport and conflict failures have
/// their own error types in the crates that own those concerns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A textual id did not parse as a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Milliseconds outside what a calendar date can hold.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_timestamp(msg: impl Into<String>) -> Self {
        Self::InvalidTimestamp(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            DomainError::invalid_id("EventId: bad").to_string(),
            "invalid identifier: EventId: bad"
        );
        assert!(DomainError::invalid_timestamp("overflow").to_string().starts_with("invalid timestamp"));
    }
}
