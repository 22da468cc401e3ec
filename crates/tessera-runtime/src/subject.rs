//! Subjects and per-subject property state (§4.A).

use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tessera_core::{PropertyValue, Source, SubjectId, SubjectTypeMetadata, Timestamp};

/// A type whose instances are `Subject`s. `describe()` is called at most
/// once per process per concrete type -- `type_metadata::<S>()` memoizes
/// the result, matching the "most-derived wins, frozen" contract.
pub trait SubjectType: 'static {
    fn describe() -> SubjectTypeMetadata;
}

fn metadata_cache() -> &'static Mutex<HashMap<TypeId, Arc<SubjectTypeMetadata>>> {
    static CACHE: OnceLock<Mutex<HashMap<TypeId, Arc<SubjectTypeMetadata>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn type_metadata<S: SubjectType>() -> Arc<SubjectTypeMetadata> {
    let key = TypeId::of::<S>();
    let mut cache = metadata_cache().lock();
    cache
        .entry(key)
        .or_insert_with(|| Arc::new(S::describe()))
        .clone()
}

/// Ancillary per-property bookkeeping: a small fixed struct, not a general
/// `(name, key) -> value` map (§9 redesign note).
#[derive(Clone, Debug, Default)]
pub struct PropertyState {
    pub last_source: Option<Source>,
    pub last_changed: Option<Timestamp>,
    /// Set while this property has an outstanding entry in the write-retry
    /// queue; cleared on successful flush.
    pub retry_pending: bool,
}

/// The uniform accessor protocol every subject routes property access
/// through. Concrete subject types are produced by an external code
/// generator (out of scope, §1); this trait is what that generator
/// targets, and what `SubjectContext` dispatches against.
pub trait Subject: Send + Sync {
    fn subject_id(&self) -> SubjectId;
    fn type_metadata(&self) -> Arc<SubjectTypeMetadata>;

    /// Read the raw backing value for a property, bypassing interceptors.
    /// Derived properties compute their value here.
    fn read_raw(&self, ordinal: u32) -> PropertyValue;

    /// Write the raw backing value for a property, bypassing interceptors.
    /// Must not be called directly for a derived property.
    fn write_raw(&self, ordinal: u32, value: PropertyValue);

    fn property_state(&self, ordinal: u32) -> PropertyState;
    fn set_property_state(&self, ordinal: u32, state: PropertyState);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::PropertyKind;

    struct Widget;
    impl SubjectType for Widget {
        fn describe() -> SubjectTypeMetadata {
            SubjectTypeMetadata::builder("Widget")
                .push(PropertyKind::Value, "name")
                .build()
        }
    }

    #[test]
    fn type_metadata_is_memoized_per_type() {
        let a = type_metadata::<Widget>();
        let b = type_metadata::<Widget>();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
