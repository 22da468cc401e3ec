//! Structural change processor (§4.E): diffs old/new values of
//! reference/collection/dictionary properties into add/remove ops.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tessera_core::{PropertyReference, SubjectId, SubjectLifecycleChange};

use crate::bus::ChangeBus;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructuralOp {
    AddReference { subject: SubjectId },
    RemoveReference { subject: SubjectId },
    AddCollectionItem { index: u32, subject: SubjectId },
    RemoveCollectionItem { index: u32, subject: SubjectId },
    AddDictionaryItem { key: String, subject: SubjectId },
    RemoveDictionaryItem { key: String, subject: SubjectId },
}

/// A `subject-reference` property transition: one remove of the old value
/// (if any) followed by one add of the new value (if any).
pub fn diff_reference(old: Option<SubjectId>, new: Option<SubjectId>) -> Vec<StructuralOp> {
    if old == new {
        return Vec::new();
    }
    let mut ops = Vec::with_capacity(2);
    if let Some(o) = old {
        ops.push(StructuralOp::RemoveReference { subject: o });
    }
    if let Some(n) = new {
        ops.push(StructuralOp::AddReference { subject: n });
    }
    ops
}

/// A `subject-dictionary` property transition: key-set diff. Order matches
/// the reference case -- removes before adds -- so a replace on the same
/// key (scenario 1) reads as one remove followed by one add.
pub fn diff_dictionary(
    old: &[(String, SubjectId)],
    new: &[(String, SubjectId)],
) -> Vec<StructuralOp> {
    let old_map: HashMap<&str, &SubjectId> =
        old.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let new_map: HashMap<&str, &SubjectId> =
        new.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let mut ops = Vec::new();
    for (key, subject) in old {
        if new_map.get(key.as_str()) != Some(&subject) {
            ops.push(StructuralOp::RemoveDictionaryItem {
                key: key.clone(),
                subject: subject.clone(),
            });
        }
    }
    for (key, subject) in new {
        if old_map.get(key.as_str()) != Some(&subject) {
            ops.push(StructuralOp::AddDictionaryItem {
                key: key.clone(),
                subject: subject.clone(),
            });
        }
    }
    ops
}

/// A `subject-collection` property transition: a minimal diff treating the
/// ordered sequences as bags plus positions.
///
/// Unchanged prefix/suffix are skipped first. Among the remaining middle,
/// items are identified by subject reference; a longest-increasing-
/// subsequence of the kept subjects' old positions is computed to minimize
/// moves. An item outside that LIS but still present in both sides is a pure
/// reorder: it is emitted as a remove+add only when `propagate_reorders` is
/// `true` (§9 connector policy), suppressed otherwise. An item present on
/// only one side is a genuine add/remove and is always emitted. Removes are
/// emitted in descending-index order, adds in ascending-index order.
pub fn diff_collection(
    old: &[SubjectId],
    new: &[SubjectId],
    propagate_reorders: bool,
) -> Vec<StructuralOp> {
    let mut start = 0;
    while start < old.len() && start < new.len() && old[start] == new[start] {
        start += 1;
    }

    let mut old_end = old.len();
    let mut new_end = new.len();
    while old_end > start && new_end > start && old[old_end - 1] == new[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let old_mid = &old[start..old_end];
    let new_mid = &new[start..new_end];

    let old_index: HashMap<&SubjectId, usize> =
        old_mid.iter().enumerate().map(|(i, s)| (s, i)).collect();
    let old_set: HashSet<&SubjectId> = old_mid.iter().collect();
    let new_set: HashSet<&SubjectId> = new_mid.iter().collect();

    let mut kept_new_positions = Vec::new();
    let mut old_idx_seq = Vec::new();
    for (j, s) in new_mid.iter().enumerate() {
        if let Some(&old_i) = old_index.get(s) {
            kept_new_positions.push(j);
            old_idx_seq.push(old_i);
        }
    }

    let lis = longest_increasing_subsequence_indices(&old_idx_seq);
    let kept_without_move: HashSet<&SubjectId> = lis
        .iter()
        .map(|&local| &new_mid[kept_new_positions[local]])
        .collect();

    let mut removals: Vec<(u32, SubjectId)> = old_mid
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            if kept_without_move.contains(s) {
                return false;
            }
            !new_set.contains(s) || propagate_reorders
        })
        .map(|(i, s)| ((start + i) as u32, s.clone()))
        .collect();
    removals.sort_by(|a, b| b.0.cmp(&a.0));

    let mut adds: Vec<(u32, SubjectId)> = new_mid
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            if kept_without_move.contains(s) {
                return false;
            }
            !old_set.contains(s) || propagate_reorders
        })
        .map(|(j, s)| ((start + j) as u32, s.clone()))
        .collect();
    adds.sort_by_key(|a| a.0);

    let mut ops = Vec::with_capacity(removals.len() + adds.len());
    ops.extend(
        removals
            .into_iter()
            .map(|(index, subject)| StructuralOp::RemoveCollectionItem { index, subject }),
    );
    ops.extend(
        adds.into_iter()
            .map(|(index, subject)| StructuralOp::AddCollectionItem { index, subject }),
    );
    ops
}

/// Returns indices into `seq` forming a longest strictly-increasing
/// subsequence, via the standard O(n log n) patience-sorting method.
fn longest_increasing_subsequence_indices(seq: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<isize> = vec![-1; seq.len()];

    for i in 0..seq.len() {
        let mut lo = 0usize;
        let mut hi = tails.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if seq[tails[mid]] < seq[i] {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo > 0 {
            prev[i] = tails[lo - 1] as isize;
        }
        if lo == tails.len() {
            tails.push(i);
        } else {
            tails[lo] = i;
        }
    }

    let mut result = Vec::new();
    if let Some(&last) = tails.last() {
        let mut cursor = last as isize;
        while cursor != -1 {
            result.push(cursor as usize);
            cursor = prev[cursor as usize];
        }
        result.reverse();
    }
    result
}

/// Receives structural add/remove callbacks. Async so a sink can await
/// registry or transport operations; the processor awaits each callback
/// sequentially to preserve causal order (§4.E).
pub trait StructuralSink: Send + Sync {
    fn on_subject_added<'a>(
        &'a self,
        property: &'a PropertyReference,
        subject: &'a SubjectId,
        index: Option<u32>,
    ) -> BoxFuture<'a, ()>;

    fn on_subject_removed<'a>(
        &'a self,
        property: &'a PropertyReference,
        subject: &'a SubjectId,
        index: Option<u32>,
    ) -> BoxFuture<'a, ()>;
}

/// The engine's own `StructuralSink`: republishes every structural add/
/// remove as a lifecycle event on the change bus, the same path a subject's
/// attach/detach takes (§4.D, §4.E). `Connector`/`SyncEngine` hand this sink
/// to the structural change processor so `StructuralAdded`/`StructuralRemoved`
/// wire changes have somewhere to originate from.
pub struct BusStructuralSink {
    bus: Arc<ChangeBus>,
}

impl BusStructuralSink {
    pub fn new(bus: Arc<ChangeBus>) -> Self {
        Self { bus }
    }
}

impl StructuralSink for BusStructuralSink {
    fn on_subject_added<'a>(
        &'a self,
        property: &'a PropertyReference,
        subject: &'a SubjectId,
        index: Option<u32>,
    ) -> BoxFuture<'a, ()> {
        let change = SubjectLifecycleChange::attached(subject.clone(), Some(property.clone()), index);
        Box::pin(async move {
            self.bus.subject_attached(change);
        })
    }

    fn on_subject_removed<'a>(
        &'a self,
        property: &'a PropertyReference,
        subject: &'a SubjectId,
        index: Option<u32>,
    ) -> BoxFuture<'a, ()> {
        let change = SubjectLifecycleChange::detached(subject.clone(), Some(property.clone()), index);
        Box::pin(async move {
            self.bus.subject_detached(change);
        })
    }
}

pub struct StructuralChangeProcessor;

impl StructuralChangeProcessor {
    /// Applies `ops` against `sink` in order, awaiting each callback before
    /// issuing the next. If a callback's future resolves to an error the
    /// caller surfaced via panic or channel, that propagates; partial
    /// emission is the caller's problem, per §4.E.
    pub async fn dispatch(
        property: &PropertyReference,
        ops: Vec<StructuralOp>,
        sink: &dyn StructuralSink,
    ) {
        for op in ops {
            match op {
                StructuralOp::AddReference { subject } => {
                    sink.on_subject_added(property, &subject, None).await;
                }
                StructuralOp::RemoveReference { subject } => {
                    sink.on_subject_removed(property, &subject, None).await;
                }
                StructuralOp::AddCollectionItem { index, subject } => {
                    sink.on_subject_added(property, &subject, Some(index)).await;
                }
                StructuralOp::RemoveCollectionItem { index, subject } => {
                    sink.on_subject_removed(property, &subject, Some(index))
                        .await;
                }
                StructuralOp::AddDictionaryItem { subject, .. } => {
                    sink.on_subject_added(property, &subject, None).await;
                }
                StructuralOp::RemoveDictionaryItem { subject, .. } => {
                    sink.on_subject_removed(property, &subject, None).await;
                }
            }
        }
    }
}
