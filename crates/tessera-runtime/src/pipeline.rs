//! Write pipeline (§2, §4.H): the glue between one property write, the
//! interceptor chain, the change bus, and -- for structural properties --
//! the structural change processor. This is the path every write actually
//! travels, whether it originates locally or from an inbound connector
//! message; `tessera::Connector`/`SyncEngine` are thin callers of the
//! functions here, not a second implementation of them.

use std::sync::Arc;
use tessera_core::{
    CoreError, PropertyKind, PropertyReference, PropertyValue, Source, SubjectId,
    SubjectPropertyChange, Timestamp,
};
use tracing::warn;

use crate::bus::ChangeBus;
use crate::derived::{reemit_dependents, DependencyTracker};
use crate::directory::SubjectDirectory;
use crate::interceptors::Chain;
use crate::structural::{
    diff_collection, diff_dictionary, diff_reference, StructuralChangeProcessor, StructuralOp,
    StructuralSink,
};
use crate::subject::Subject;

/// Mutable state threaded through the write interceptor chain. An
/// interceptor may replace `new_value` (clamp, transform, veto by leaving
/// it equal to `old_value`); the terminal only persists and publishes when
/// the two still differ once the chain has run.
pub struct WriteContext {
    pub subject: Arc<dyn Subject>,
    pub property: PropertyReference,
    pub source: Source,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

/// Applies one local write to a plain value property: rejects derived
/// properties outright, runs the interceptor chain, persists via
/// `write_raw` when the chain leaves the value changed, publishes on
/// `bus`, and re-emits any derived properties that depended on this one.
///
/// `source`/`changed_timestamp` are supplied by the caller rather than
/// read from the ambient scope here -- the facade establishes a
/// `WithSource`/`WithChangedTimestamp` scope and resolves `current_source`/
/// `current_changed_timestamp` before calling in, so this function stays
/// usable from contexts (like tests) with no scope active at all.
pub fn apply_local_write(
    chain: &Chain<WriteContext>,
    bus: &ChangeBus,
    tracker: &DependencyTracker,
    subject: Arc<dyn Subject>,
    ordinal: u32,
    new_value: PropertyValue,
    source: Source,
    changed_timestamp: Timestamp,
) -> Result<(), CoreError> {
    let metadata = subject.type_metadata();
    let meta = metadata.property_by_ordinal(ordinal).ok_or_else(|| {
        CoreError::InvalidOperation(format!("no property at ordinal {ordinal}"))
    })?;
    if meta.is_derived {
        return Err(CoreError::InvalidOperation(format!(
            "{} is a derived property and cannot be written directly",
            meta.name
        )));
    }

    let property = PropertyReference::new(subject.subject_id(), ordinal, meta.name.clone());
    let old_value = subject.read_raw(ordinal);
    let mut ctx = WriteContext {
        subject: subject.clone(),
        property: property.clone(),
        source,
        old_value: old_value.clone(),
        new_value,
    };

    chain.dispatch(&mut ctx, &|ctx| {
        if ctx.old_value != ctx.new_value {
            ctx.subject.write_raw(ordinal, ctx.new_value.clone());
        }
    });

    if ctx.old_value == ctx.new_value {
        return Ok(());
    }

    let change = SubjectPropertyChange::new(
        property,
        ctx.source.clone(),
        ctx.old_value.clone(),
        ctx.new_value.clone(),
    )
    .with_changed_timestamp(changed_timestamp);
    bus.property_changed(change);
    reemit_dependents(tracker, bus, &subject, ordinal);
    Ok(())
}

/// Applies one local write to a reference/collection/dictionary property:
/// runs the interceptor chain the same way `apply_local_write` does, then
/// -- once persisted -- diffs old against new into structural ops and
/// dispatches them through `sink`, cascading the teardown of any removed
/// child's own structural properties up to `max_nesting_depth`.
#[allow(clippy::too_many_arguments)]
pub async fn apply_structural_write(
    chain: &Chain<WriteContext>,
    bus: &ChangeBus,
    directory: &SubjectDirectory,
    sink: &dyn StructuralSink,
    subject: Arc<dyn Subject>,
    ordinal: u32,
    new_value: PropertyValue,
    source: Source,
    changed_timestamp: Timestamp,
    propagate_reorders: bool,
    max_nesting_depth: u32,
) -> Result<(), CoreError> {
    let metadata = subject.type_metadata();
    let meta = metadata.property_by_ordinal(ordinal).ok_or_else(|| {
        CoreError::InvalidOperation(format!("no property at ordinal {ordinal}"))
    })?;
    if meta.is_derived {
        return Err(CoreError::InvalidOperation(format!(
            "{} is a derived property and cannot be written directly",
            meta.name
        )));
    }
    let kind = meta.kind;

    let property = PropertyReference::new(subject.subject_id(), ordinal, meta.name.clone());
    let old_value = subject.read_raw(ordinal);
    let mut ctx = WriteContext {
        subject: subject.clone(),
        property: property.clone(),
        source,
        old_value: old_value.clone(),
        new_value,
    };

    chain.dispatch(&mut ctx, &|ctx| {
        if ctx.old_value != ctx.new_value {
            ctx.subject.write_raw(ordinal, ctx.new_value.clone());
        }
    });

    if ctx.old_value == ctx.new_value {
        return Ok(());
    }

    let ops = match kind {
        PropertyKind::SubjectReference => diff_reference(
            as_single(&ctx.old_value),
            as_single(&ctx.new_value),
        ),
        PropertyKind::SubjectCollection => diff_collection(
            as_collection(&ctx.old_value),
            as_collection(&ctx.new_value),
            propagate_reorders,
        ),
        PropertyKind::SubjectDictionary => {
            diff_dictionary(as_dictionary(&ctx.old_value), as_dictionary(&ctx.new_value))
        }
        PropertyKind::Value | PropertyKind::Method => {
            return Err(CoreError::InvalidOperation(format!(
                "{} is not a structural property",
                meta.name
            )))
        }
    };

    let removed: Vec<SubjectId> = ops
        .iter()
        .filter_map(|op| match op {
            StructuralOp::RemoveReference { subject }
            | StructuralOp::RemoveCollectionItem { subject, .. }
            | StructuralOp::RemoveDictionaryItem { subject, .. } => Some(subject.clone()),
            _ => None,
        })
        .collect();

    StructuralChangeProcessor::dispatch(&property, ops, sink).await;

    for child in removed {
        cascade_detach(directory, sink, &child, 1, max_nesting_depth).await;
    }

    let change = SubjectPropertyChange::new(
        property,
        ctx.source.clone(),
        ctx.old_value.clone(),
        ctx.new_value.clone(),
    )
    .with_changed_timestamp(changed_timestamp);
    bus.property_changed(change);
    Ok(())
}

/// Tears down a removed subject's own structural properties, so a child
/// dropped from a collection doesn't leave its own children dangling in
/// an attached state. Stops (with a warning, not a panic) once `depth`
/// reaches `max_depth` -- the recursion guard `ConnectorOptions::
/// max_nesting_depth` exists for: a cyclic or pathologically deep subject
/// graph must not blow the stack or loop forever.
fn cascade_detach<'a>(
    directory: &'a SubjectDirectory,
    sink: &'a dyn StructuralSink,
    subject_id: &'a SubjectId,
    depth: u32,
    max_depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        if depth > max_depth {
            warn!(
                subject = %subject_id,
                max_depth,
                "subject graph nesting exceeded max_nesting_depth; stopping cascade here"
            );
            return;
        }
        let Some(subject) = directory.get(subject_id) else {
            return;
        };
        let metadata = subject.type_metadata();
        for meta in metadata.properties.iter() {
            if meta.is_derived {
                continue;
            }
            let value = subject.read_raw(meta.ordinal);
            let property = PropertyReference::new(subject_id.clone(), meta.ordinal, meta.name.clone());
            let children: Vec<SubjectId> = match meta.kind {
                PropertyKind::SubjectReference => as_single(&value).into_iter().collect(),
                PropertyKind::SubjectCollection => as_collection(&value).to_vec(),
                PropertyKind::SubjectDictionary => {
                    as_dictionary(&value).iter().map(|(_, s)| s.clone()).collect()
                }
                PropertyKind::Value | PropertyKind::Method => continue,
            };
            for child in children {
                sink.on_subject_removed(&property, &child, None).await;
                cascade_detach(directory, sink, &child, depth + 1, max_depth).await;
            }
        }
    })
}

fn as_single(value: &PropertyValue) -> Option<SubjectId> {
    match value {
        PropertyValue::Subject(id) => Some(id.clone()),
        _ => None,
    }
}

fn as_collection(value: &PropertyValue) -> &[SubjectId] {
    match value {
        PropertyValue::Subjects(ids) => ids,
        _ => &[],
    }
}

fn as_dictionary(value: &PropertyValue) -> &[(String, SubjectId)] {
    match value {
        PropertyValue::Dictionary(entries) => entries,
        _ => &[],
    }
}
