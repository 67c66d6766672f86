//! Logical time.
//!
//! Events are ordered by `(timestamp, sequence)` within an operation. The
//! timestamp is wall-clock milliseconds, but each device runs a hybrid logical
//! clock so the pair is strictly increasing per device even when the wall
//! clock stalls or steps backwards, and so events emitted in reaction to a
//! remote event always sort after it.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn plus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub fn minus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Absolute distance between two timestamps, in milliseconds.
    pub fn distance(self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }

    pub fn to_datetime(self) -> DomainResult<DateTime<Utc>> {
        let millis = i64::try_from(self.0)
            .map_err(|_| DomainError::invalid_timestamp(format!("{} ms overflows i64", self.0)))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| DomainError::invalid_timestamp(format!("{millis} ms is out of range")))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis().max(0) as u64)
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A point on a device's logical clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: Timestamp,
    /// Tie-break for events sharing a timestamp.
    pub sequence: u32,
}

impl Stamp {
    pub fn new(timestamp: Timestamp, sequence: u32) -> Self {
        Self { timestamp, sequence }
    }
}

/// Hybrid logical clock owned by one device.
#[derive(Debug, Default)]
pub struct DeviceClock {
    last: Mutex<Stamp>,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp using the current wall clock.
    pub fn tick(&self) -> Stamp {
        self.tick_at(Timestamp::now())
    }

    /// Next stamp given an explicit wall-clock reading.
    ///
    /// The result is strictly greater than every stamp previously returned or
    /// observed by this clock.
    pub fn tick_at(&self, wall: Timestamp) -> Stamp {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if wall > last.timestamp {
            *last = Stamp::new(wall, 0);
        } else {
            last.sequence = last.sequence.saturating_add(1);
        }
        *last
    }

    /// Advance past a stamp seen on another device.
    pub fn observe(&self, seen: Stamp) {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen > *last {
            *last = seen;
        }
    }

    /// Most recent stamp issued or observed.
    pub fn last(&self) -> Stamp {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
