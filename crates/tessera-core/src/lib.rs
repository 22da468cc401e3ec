//! Shared data model for the subject/connector graph-sync engine: subject
//! and property identity, property values, changes, and the wire-stable
//! stream DTOs built on top of them.
//!
//! This crate has no async runtime dependency and no transport knowledge --
//! it is the vocabulary `tessera-runtime` and `tessera-wire` both speak.

mod change;
mod error;
mod ids;
mod property;
mod stream;
mod timestamp;

pub use change::{PropertyValue, Source, SubjectLifecycleChange, SubjectPropertyChange, LifecycleKind};
pub use error::{ConnectorError, CoreError, RegistryConflictKind};
pub use ids::{ConnectorId, ExternalId, SubjectId};
pub use property::{
    PropertyKind, PropertyReference, SubjectPropertyMetadata, SubjectTypeMetadata,
    SubjectTypeMetadataBuilder,
};
pub use stream::{PullChangesRequest, PullChangesResponse, SeqNo, StampedChange, StreamCursor, StreamId, WireChange};
pub use timestamp::{Timestamp, TimestampMillis};
