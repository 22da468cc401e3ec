use crate::ids::{ConnectorId, SubjectId};
use crate::property::PropertyReference;
use crate::timestamp::Timestamp;
use facet::Facet;
use facet_value::Value;

/// Who produced a change. `Local` means a direct application write; a
/// connector tags every write it performs (inbound from its remote system)
/// with its own id so the change-queue can suppress the echo back to it.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Source {
    Local,
    Connector(ConnectorId),
}

/// The value carried by one side of a property transition.
///
/// `Value` (scalar JSON-shaped data) covers `PropertyKind::Value`;
/// the subject-shaped variants cover reference/collection/dictionary
/// properties. `Absent` represents "no value yet" (e.g. the old side of a
/// freshly-attached reference).
#[derive(Facet, Clone, Debug, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum PropertyValue {
    Absent,
    Scalar(Value),
    Subject(SubjectId),
    Subjects(Vec<SubjectId>),
    Dictionary(Vec<(String, SubjectId)>),
}

/// An immutable record describing a single property transition.
///
/// All fields are fixed at construction; `SubjectPropertyChange` is never
/// mutated once built, only read and eventually emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectPropertyChange {
    pub property_ref: PropertyReference,
    pub source: Source,
    pub changed_timestamp: Timestamp,
    pub received_timestamp: Option<Timestamp>,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

impl SubjectPropertyChange {
    pub fn new(
        property_ref: PropertyReference,
        source: Source,
        old_value: PropertyValue,
        new_value: PropertyValue,
    ) -> Self {
        Self {
            property_ref,
            source,
            changed_timestamp: Timestamp::now(),
            received_timestamp: None,
            old_value,
            new_value,
        }
    }

    pub fn with_changed_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.changed_timestamp = timestamp;
        self
    }

    pub fn with_received_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.received_timestamp = Some(timestamp);
        self
    }

    /// True when this change was produced by the given connector, i.e. it
    /// must not be emitted back to that same connector (loop suppression).
    pub fn is_from(&self, connector: &ConnectorId) -> bool {
        matches!(&self.source, Source::Connector(id) if id == connector)
    }
}

/// Attach/detach transition, or a parent-set change, for a subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleKind {
    Attached,
    Detached,
}

/// A subject may have multiple parents (DAG); `parent_property`/`index`
/// identify the specific edge that changed, not the whole parent set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectLifecycleChange {
    pub subject: SubjectId,
    pub parent_property: Option<PropertyReference>,
    pub index: Option<u32>,
    pub kind: LifecycleKind,
}

impl SubjectLifecycleChange {
    pub fn attached(
        subject: SubjectId,
        parent_property: Option<PropertyReference>,
        index: Option<u32>,
    ) -> Self {
        Self {
            subject,
            parent_property,
            index,
            kind: LifecycleKind::Attached,
        }
    }

    pub fn detached(
        subject: SubjectId,
        parent_property: Option<PropertyReference>,
        index: Option<u32>,
    ) -> Self {
        Self {
            subject,
            parent_property,
            index,
            kind: LifecycleKind::Detached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyReference;

    #[test]
    fn is_from_matches_only_the_same_connector() {
        let pref = PropertyReference::new(SubjectId::new(), 0, "p");
        let k = ConnectorId::new();
        let l = ConnectorId::new();
        let change = SubjectPropertyChange::new(
            pref,
            Source::Connector(k.clone()),
            PropertyValue::Absent,
            PropertyValue::Scalar(Value::NULL),
        );
        assert!(change.is_from(&k));
        assert!(!change.is_from(&l));
    }

    #[test]
    fn local_source_never_matches_a_connector() {
        let pref = PropertyReference::new(SubjectId::new(), 0, "p");
        let change = SubjectPropertyChange::new(
            pref,
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(Value::NULL),
        );
        assert!(!change.is_from(&ConnectorId::new()));
    }
}
