//! Field-level change detection and merging.
//!
//! Records are JSON objects. Nested objects are compared field by field and
//! addressed by a [`FieldPath`]; arrays and scalars are compared as whole
//! values.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use opsync_core::{ActorId, Timestamp};

/// Top-level fields skipped by default: bookkeeping that changes on every
/// write without carrying user intent.
pub const VOLATILE_FIELDS: &[&str] = &[
    "updated_at",
    "modified_at",
    "version",
    "hash",
    "previous_hash",
    "sync_status",
    "sync_attempts",
    "sync_error",
];

/// Path of a field inside a record, outermost key first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// A single top-level field.
    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_string());
        Self(segments)
    }
}

impl core::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// One field's change between two versions of a record.
///
/// `None` means the field was absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: FieldPath,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: Timestamp,
    pub actor_id: ActorId,
}

pub type ChangeSet = Vec<FieldChange>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChangeError {
    #[error("stale change to `{path}`: expected {expected:?}, found {found:?}")]
    Stale {
        path: FieldPath,
        expected: Option<Value>,
        found: Option<Value>,
    },

    #[error("invalid value for `{path}`: {reason}")]
    Invalid { path: FieldPath, reason: String },

    #[error("record is not a JSON object")]
    NotAnObject,
}

/// Format or range check for one field, run after the staleness check.
pub trait FieldValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), String>;
}

/// Non-empty string.
#[derive(Debug, Default, Copy, Clone)]
pub struct NonEmptyText;

impl FieldValidator for NonEmptyText {
    fn validate(&self, value: &Value) -> Result<(), String> {
        match value.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err("must not be empty".to_string()),
            None => Err("must be a string".to_string()),
        }
    }
}

/// Integer within `[min, max]`.
#[derive(Debug, Copy, Clone)]
pub struct IntegerRange {
    pub min: i64,
    pub max: i64,
}

impl FieldValidator for IntegerRange {
    fn validate(&self, value: &Value) -> Result<(), String> {
        let n = value.as_i64().ok_or_else(|| "must be an integer".to_string())?;
        if n < self.min || n > self.max {
            return Err(format!("{n} is outside {}..={}", self.min, self.max));
        }
        Ok(())
    }
}

/// One of a fixed set of strings.
#[derive(Debug, Clone)]
pub struct OneOf(pub BTreeSet<String>);

impl OneOf {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(allowed.into_iter().map(Into::into).collect())
    }
}

impl FieldValidator for OneOf {
    fn validate(&self, value: &Value) -> Result<(), String> {
        match value.as_str() {
            Some(s) if self.0.contains(s) => Ok(()),
            _ => Err(format!("must be one of {:?}", self.0)),
        }
    }
}

/// Computes, merges and validates field-level changes.
pub struct ChangeDetector {
    ignored: BTreeSet<String>,
    validators: BTreeMap<FieldPath, Vec<Box<dyn FieldValidator>>>,
}

impl core::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("ignored", &self.ignored)
            .field("validated_fields", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    /// Detector ignoring [`VOLATILE_FIELDS`].
    pub fn new() -> Self {
        Self {
            ignored: VOLATILE_FIELDS.iter().map(|f| f.to_string()).collect(),
            validators: BTreeMap::new(),
        }
    }

    /// Detector that compares every field.
    pub fn without_ignored_fields() -> Self {
        Self {
            ignored: BTreeSet::new(),
            validators: BTreeMap::new(),
        }
    }

    pub fn with_ignored_field(mut self, field: impl Into<String>) -> Self {
        self.ignored.insert(field.into());
        self
    }

    pub fn with_validator(mut self, path: FieldPath, validator: impl FieldValidator + 'static) -> Self {
        self.validators.entry(path).or_default().push(Box::new(validator));
        self
    }

    /// Field-by-field differences from `old` to `new`, ordered by path.
    ///
    /// Non-object inputs are treated as empty records.
    pub fn detect_changes(&self, old: &Value, new: &Value, actor_id: ActorId, timestamp: Timestamp) -> ChangeSet {
        let empty = Map::new();
        let old = old.as_object().unwrap_or(&empty);
        let new = new.as_object().unwrap_or(&empty);
        let mut changes = Vec::new();
        self.diff_objects(&FieldPath::new(Vec::<String>::new()), old, new, actor_id, timestamp, &mut changes);
        changes
    }

    fn diff_objects(
        &self,
        prefix: &FieldPath,
        old: &Map<String, Value>,
        new: &Map<String, Value>,
        actor_id: ActorId,
        timestamp: Timestamp,
        out: &mut ChangeSet,
    ) {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for key in keys {
            if prefix.segments().is_empty() && self.ignored.contains(key.as_str()) {
                continue;
            }
            let path = prefix.child(key);
            match (old.get(key), new.get(key)) {
                (Some(Value::Object(a)), Some(Value::Object(b))) => {
                    self.diff_objects(&path, a, b, actor_id, timestamp, out);
                }
                (a, b) if a == b => {}
                (a, b) => out.push(FieldChange {
                    path,
                    old_value: a.cloned(),
                    new_value: b.cloned(),
                    timestamp,
                    actor_id,
                }),
            }
        }
    }

    /// Apply every change from `change_sets` to `base` in timestamp order.
    ///
    /// Later writes to the same field overwrite earlier ones; equal timestamps
    /// are ordered by actor id so the result does not depend on the order of
    /// `change_sets`.
    pub fn merge_changes(&self, base: &Value, change_sets: &[ChangeSet]) -> Value {
        let mut changes: Vec<&FieldChange> = change_sets.iter().flatten().collect();
        changes.sort_by(|a, b| (a.timestamp, a.actor_id).cmp(&(b.timestamp, b.actor_id)));

        let mut record = match base {
            Value::Object(_) => base.clone(),
            _ => Value::Object(Map::new()),
        };
        for change in changes {
            write_path(&mut record, &change.path, change.new_value.clone());
        }
        record
    }

    /// Reject `change` if its expected old value no longer matches `current`,
    /// then run the field's validators on the new value.
    pub fn validate_change(&self, change: &FieldChange, current: &Value) -> Result<(), ChangeError> {
        if !current.is_object() {
            return Err(ChangeError::NotAnObject);
        }
        let found = read_path(current, &change.path);
        if found != change.old_value.as_ref() {
            return Err(ChangeError::Stale {
                path: change.path.clone(),
                expected: change.old_value.clone(),
                found: found.cloned(),
            });
        }
        if let (Some(value), Some(validators)) = (&change.new_value, self.validators.get(&change.path)) {
            for validator in validators {
                validator.validate(value).map_err(|reason| ChangeError::Invalid {
                    path: change.path.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    /// Validate, then write the change into `record`.
    pub fn apply_change(&self, record: &mut Value, change: &FieldChange) -> Result<(), ChangeError> {
        self.validate_change(change, record)?;
        write_path(record, &change.path, change.new_value.clone());
        Ok(())
    }
}

fn read_path<'a>(record: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(record, |value, key| value.as_object()?.get(key))
}

/// Set (or remove, for `None`) the value at `path`, creating intermediate
/// objects. A non-object in the way is replaced.
fn write_path(record: &mut Value, path: &FieldPath, value: Option<Value>) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = record;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        match value {
            Some(v) => {
                map.insert(last.clone(), v);
            }
            None => {
                map.remove(last);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn detects_nested_changes_and_skips_volatile_fields() {
        let detector = ChangeDetector::new();
        let actor = ActorId::new();
        let old = json!({"name": "Shelter 3", "capacity": {"beds": 40, "cots": 10}, "updated_at": 1});
        let new = json!({"name": "Shelter 3", "capacity": {"beds": 45, "cots": 10}, "status": "open", "updated_at": 2});

        let changes = detector.detect_changes(&old, &new, actor, at(100));
        let paths: Vec<String> = changes.iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["capacity.beds", "status"]);
        assert_eq!(changes[0].old_value, Some(json!(40)));
        assert_eq!(changes[0].new_value, Some(json!(45)));
        assert_eq!(changes[1].old_value, None);
        assert!(changes.iter().all(|c| c.actor_id == actor && c.timestamp == at(100)));
    }

    #[test]
    fn removed_fields_have_no_new_value() {
        let detector = ChangeDetector::new();
        let changes = detector.detect_changes(&json!({"a": 1}), &json!({}), ActorId::new(), at(1));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_value, None);
    }

    #[test]
    fn merge_applies_changes_chronologically() {
        let detector = ChangeDetector::new();
        let base = json!({"status": "open", "beds": 40});
        let a = detector.detect_changes(&base, &json!({"status": "full", "beds": 40}), ActorId::new(), at(20));
        let b = detector.detect_changes(&base, &json!({"status": "closed", "beds": 30}), ActorId::new(), at(10));

        let merged = detector.merge_changes(&base, &[a.clone(), b.clone()]);
        assert_eq!(merged, json!({"status": "full", "beds": 30}));
        assert_eq!(detector.merge_changes(&base, &[b, a]), merged);
    }

    #[test]
    fn stale_changes_are_rejected() {
        let detector = ChangeDetector::new();
        let base = json!({"beds": 40});
        let change = detector
            .detect_changes(&base, &json!({"beds": 45}), ActorId::new(), at(1))
            .remove(0);

        assert!(detector.validate_change(&change, &base).is_ok());
        let moved_on = json!({"beds": 42});
        assert!(matches!(
            detector.validate_change(&change, &moved_on),
            Err(ChangeError::Stale { found: Some(_), .. })
        ));
    }

    #[test]
    fn validators_run_after_staleness_check() {
        let detector = ChangeDetector::new()
            .with_validator(FieldPath::field("beds"), IntegerRange { min: 0, max: 500 })
            .with_validator(FieldPath::field("status"), OneOf::new(["open", "full", "closed"]));
        let mut record = json!({"beds": 40, "status": "open"});

        let bad = detector
            .detect_changes(&record, &json!({"beds": -1, "status": "open"}), ActorId::new(), at(1))
            .remove(0);
        assert!(matches!(detector.validate_change(&bad, &record), Err(ChangeError::Invalid { .. })));

        let good = detector
            .detect_changes(&record, &json!({"beds": 40, "status": "full"}), ActorId::new(), at(2))
            .remove(0);
        detector.apply_change(&mut record, &good).unwrap();
        assert_eq!(record["status"], "full");
        assert!(NonEmptyText.validate(&json!("  ")).is_err());
    }
}
