use crate::change::{PropertyValue, Source, SubjectPropertyChange};
use crate::ids::SubjectId;
use facet::Facet;
use std::fmt;

/// Monotonically increasing position within one connector's outbound
/// change stream.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct SeqNo(u64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Names one connector's outbound stream; used when a connector reconnects
/// and needs to resume from a cursor instead of replaying everything.
#[derive(Facet, Clone, Debug, PartialEq, Eq, Hash)]
#[facet(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One outbound delta, in the wire-stable shape emitted by the change-queue
/// and the structural change processor.
#[derive(Facet, Clone, Debug, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum WireChange {
    PropertyChanged {
        subject: SubjectId,
        property: String,
        ordinal: u32,
        old_value: PropertyValue,
        new_value: PropertyValue,
        source: Source,
        changed_at_ms: u64,
    },
    StructuralAdded {
        subject: SubjectId,
        property: String,
        index: Option<u32>,
        child: SubjectId,
    },
    StructuralRemoved {
        subject: SubjectId,
        property: String,
        index: Option<u32>,
        child: SubjectId,
    },
    SubjectAttached {
        subject: SubjectId,
    },
    SubjectDetached {
        subject: SubjectId,
    },
}

/// A change paired with its assigned position in the stream.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct StampedChange {
    pub seq_no: SeqNo,
    pub change: WireChange,
}

/// Pull-based delta protocol request: "give me what's after `from_seq_no`".
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct PullChangesRequest {
    pub stream_id: StreamId,
    pub from_seq_no: SeqNo,
    pub max_changes: u32,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct PullChangesResponse {
    pub stream_id: StreamId,
    pub from_seq_no: SeqNo,
    pub next_seq_no: SeqNo,
    pub changes: Vec<StampedChange>,
    pub truncated: bool,
}

/// What a connector needs to persist across a reconnect to resume its pull.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct StreamCursor {
    pub stream_id: StreamId,
    pub next_seq_no: SeqNo,
}

impl WireChange {
    /// Maps a value-property transition to its wire shape. Structural
    /// (reference/collection/dictionary) transitions are represented by
    /// `StructuralAdded`/`StructuralRemoved` instead, emitted directly by
    /// the structural change processor rather than through this path.
    pub fn from_property_change(change: &SubjectPropertyChange) -> Self {
        WireChange::PropertyChanged {
            subject: change.property_ref.subject.clone(),
            property: change.property_ref.name.to_string(),
            ordinal: change.property_ref.ordinal,
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            source: change.source.clone(),
            changed_at_ms: change.changed_timestamp.resolve_or_clock().as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_no_next_is_strictly_increasing() {
        let a = SeqNo::ZERO;
        let b = a.next();
        assert!(b > a);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn property_change_maps_to_the_matching_wire_shape() {
        use crate::property::PropertyReference;

        let change = SubjectPropertyChange::new(
            PropertyReference::new(SubjectId::new(), 2, "count"),
            Source::Local,
            PropertyValue::Scalar(1u64.into()),
            PropertyValue::Scalar(2u64.into()),
        );
        let wire = WireChange::from_property_change(&change);
        match wire {
            WireChange::PropertyChanged {
                property, ordinal, ..
            } => {
                assert_eq!(property, "count");
                assert_eq!(ordinal, 2);
            }
            other => panic!("expected PropertyChanged, got {other:?}"),
        }
    }
}
