//! Derived-property dependency tracking (§4.A edge case).
//!
//! A derived property is read-only; writes to it fail with
//! `InvalidOperation` (enforced by the subject's own `write_raw`, not this
//! module). Its value is recomputed from other properties on the same
//! subject, and its change must be re-emitted whenever a property it read
//! during the last computation changes -- "the dependency-tracking
//! interceptor records read sets during the derived read and re-emits on
//! input change".

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_core::{PropertyReference, PropertyValue, Source, SubjectId, SubjectPropertyChange};

use crate::bus::ChangeBus;
use crate::subject::Subject;

thread_local! {
    static RECORDING: RefCell<Vec<HashSet<u32>>> = RefCell::new(Vec::new());
}

/// Called from a `Subject::read_raw` implementation whenever it reads
/// another property's ordinal while computing a derived value. A no-op
/// when called outside `DependencyTracker::track`.
pub fn record_read(ordinal: u32) {
    RECORDING.with(|stack| {
        if let Some(top) = stack.borrow_mut().last_mut() {
            top.insert(ordinal);
        }
    });
}

/// Per-subject map of `derived_ordinal -> {ordinals read on last compute}`.
pub struct DependencyTracker {
    deps: Mutex<HashMap<SubjectId, HashMap<u32, HashSet<u32>>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self {
            deps: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `compute`, recording every ordinal read via `record_read`
    /// during it, and stores the resulting read set against
    /// `derived_ordinal`. Nested `track` calls (a derived property reading
    /// another derived property) each get their own isolated read set.
    pub fn track(
        &self,
        subject: &SubjectId,
        derived_ordinal: u32,
        compute: impl FnOnce() -> PropertyValue,
    ) -> PropertyValue {
        RECORDING.with(|stack| stack.borrow_mut().push(HashSet::new()));
        let value = compute();
        let read = RECORDING.with(|stack| stack.borrow_mut().pop().unwrap_or_default());
        self.deps
            .lock()
            .entry(subject.clone())
            .or_default()
            .insert(derived_ordinal, read);
        value
    }

    /// Derived ordinals on `subject` whose last recorded read set includes
    /// `changed_ordinal`.
    pub fn dependents_of(&self, subject: &SubjectId, changed_ordinal: u32) -> Vec<u32> {
        let deps = self.deps.lock();
        match deps.get(subject) {
            None => Vec::new(),
            Some(by_derived) => by_derived
                .iter()
                .filter(|(_, read)| read.contains(&changed_ordinal))
                .map(|(&derived, _)| derived)
                .collect(),
        }
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes every derived property of `subject` that depended on
/// `changed_ordinal` in its last computation, and publishes a
/// `PropertyChanged` event on `bus` for each one whose value actually
/// moved (equality-suppressed, matching every other write path).
pub fn reemit_dependents(
    tracker: &DependencyTracker,
    bus: &ChangeBus,
    subject: &Arc<dyn Subject>,
    changed_ordinal: u32,
) {
    let subject_id = subject.subject_id();
    let metadata = subject.type_metadata();
    for derived_ordinal in tracker.dependents_of(&subject_id, changed_ordinal) {
        let previous = subject.read_raw(derived_ordinal);
        let recomputed = tracker.track(&subject_id, derived_ordinal, || {
            subject.read_raw(derived_ordinal)
        });
        if previous == recomputed {
            continue;
        }
        let Some(meta) = metadata.property_by_ordinal(derived_ordinal) else {
            continue;
        };
        let property_ref = PropertyReference::new(subject_id.clone(), derived_ordinal, meta.name.clone());
        bus.property_changed(SubjectPropertyChange::new(
            property_ref,
            Source::Local,
            previous,
            recomputed,
        ));
    }
}
