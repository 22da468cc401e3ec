use crate::ids::SubjectId;
use facet::Facet;
use std::sync::Arc;

/// The kind of a subject's property, fixed at metadata-build time.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum PropertyKind {
    Value,
    SubjectReference,
    SubjectCollection,
    SubjectDictionary,
    Method,
}

/// A stable identity for a mutation site: the pair (subject, property-name).
///
/// Subjects are identified by their opaque `SubjectId` rather than a Rust
/// reference -- the framework never extends a subject's lifetime, so it can
/// only hold an indirect handle to it. Equality and hashing combine the
/// subject id and the property's ordinal position in its type's metadata
/// table, matching `PropertyReference`'s reference-equality-plus-ordinal
/// contract without requiring unsafe pointer identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PropertyReference {
    pub subject: SubjectId,
    pub ordinal: u32,
    pub name: Arc<str>,
}

impl PropertyReference {
    pub fn new(subject: SubjectId, ordinal: u32, name: impl Into<Arc<str>>) -> Self {
        Self {
            subject,
            ordinal,
            name: name.into(),
        }
    }
}

/// Per-property metadata, built once per subject type and frozen.
///
/// `read`/`write` are the type-erased accessor entry points the subject's
/// context dispatches through after running the interceptor chain; a
/// derived property has `write = None`.
#[derive(Clone)]
pub struct SubjectPropertyMetadata {
    pub name: Arc<str>,
    pub ordinal: u32,
    pub kind: PropertyKind,
    pub is_derived: bool,
    pub attributes: Arc<[Arc<str>]>,
}

impl SubjectPropertyMetadata {
    pub fn new(name: impl Into<Arc<str>>, ordinal: u32, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind,
            is_derived: false,
            attributes: Arc::from(Vec::new().into_boxed_slice()),
        }
    }

    pub fn derived(mut self) -> Self {
        self.is_derived = true;
        self
    }

    pub fn with_attributes(mut self, attrs: impl IntoIterator<Item = Arc<str>>) -> Self {
        self.attributes = attrs.into_iter().collect::<Vec<_>>().into();
        self
    }
}

/// The frozen, process-wide metadata table for one subject type.
///
/// Built once (most-derived wins for overlapping names) and memoized;
/// `SubjectType::describe()` is the only place a table is constructed.
#[derive(Clone)]
pub struct SubjectTypeMetadata {
    pub type_name: &'static str,
    pub properties: Arc<[SubjectPropertyMetadata]>,
}

impl SubjectTypeMetadata {
    pub fn builder(type_name: &'static str) -> SubjectTypeMetadataBuilder {
        SubjectTypeMetadataBuilder {
            type_name,
            properties: Vec::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&SubjectPropertyMetadata> {
        self.properties.iter().find(|p| &*p.name == name)
    }

    pub fn property_by_ordinal(&self, ordinal: u32) -> Option<&SubjectPropertyMetadata> {
        self.properties.get(ordinal as usize)
    }
}

pub struct SubjectTypeMetadataBuilder {
    type_name: &'static str,
    properties: Vec<SubjectPropertyMetadata>,
}

impl SubjectTypeMetadataBuilder {
    pub fn push(mut self, kind: PropertyKind, name: impl Into<Arc<str>>) -> Self {
        let ordinal = self.properties.len() as u32;
        self.properties
            .push(SubjectPropertyMetadata::new(name, ordinal, kind));
        self
    }

    pub fn push_derived(mut self, kind: PropertyKind, name: impl Into<Arc<str>>) -> Self {
        let ordinal = self.properties.len() as u32;
        self.properties
            .push(SubjectPropertyMetadata::new(name, ordinal, kind).derived());
        self
    }

    pub fn build(self) -> SubjectTypeMetadata {
        SubjectTypeMetadata {
            type_name: self.type_name,
            properties: self.properties.into(),
        }
    }
}
