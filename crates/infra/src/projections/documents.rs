use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use opsync_events::{Event, EventPayload, EventType, Projection, RegisterValue};

use super::LwwVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: RegisterValue,
    pub version: LwwVersion,
}

/// Fields of one document section.
pub type Section = BTreeMap<String, FieldValue>;

/// Sections of one document.
pub type Document = BTreeMap<String, Section>;

/// Document view with field-level last-write-wins.
///
/// Two devices editing different fields of the same section both keep their
/// edits; only writes to the same field compete.
#[derive(Debug, Default, Copy, Clone)]
pub struct DocumentsProjection;

impl DocumentsProjection {
    pub const NAME: &'static str = "documents";
}

impl Projection for DocumentsProjection {
    type State = BTreeMap<String, Document>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::SectionEdited
    }

    fn fold(&self, mut state: Self::State, event: &Event) -> Self::State {
        let EventPayload::SectionEdited(p) = &event.payload else {
            return state;
        };
        let version = LwwVersion::of(event);
        let section = state
            .entry(p.document_id.clone())
            .or_default()
            .entry(p.section.clone())
            .or_default();
        for (field, value) in &p.fields {
            if section.get(field).is_none_or(|current| version > current.version) {
                section.insert(
                    field.clone(),
                    FieldValue {
                        value: value.clone(),
                        version,
                    },
                );
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{event_at, reversed};
    use opsync_events::{ProjectionRunner, SectionEdited};

    fn edit(fields: &[(&str, RegisterValue)], millis: u64) -> Event {
        event_at(
            EventPayload::SectionEdited(SectionEdited {
                document_id: "sitrep-1".to_string(),
                section: "logistics".to_string(),
                fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            }),
            millis,
        )
    }

    #[test]
    fn concurrent_edits_to_different_fields_both_survive() {
        let events = vec![
            edit(&[("water", RegisterValue::Int(40)), ("fuel", "low".into())], 10),
            edit(&[("fuel", "critical".into())], 20),
            edit(&[("water", RegisterValue::Int(35))], 5),
        ];
        let forward = ProjectionRunner::rebuild_from_scratch(DocumentsProjection, &events).unwrap();
        let backward = ProjectionRunner::rebuild_from_scratch(DocumentsProjection, reversed(&events)).unwrap();
        assert_eq!(forward.state(), backward.state());

        let section = &forward.state()["sitrep-1"]["logistics"];
        assert_eq!(section["water"].value, RegisterValue::Int(40));
        assert_eq!(section["fuel"].value, RegisterValue::Text("critical".to_string()));
    }
}
