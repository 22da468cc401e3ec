//! Change-queue processor (§4.G): buffers changes over a flush window,
//! dedupes by property (last-write-wins, order of last occurrence
//! preserved), and flushes in one batch.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    ConnectorId, PropertyReference, PullChangesResponse, SeqNo, StampedChange, StreamId,
    SubjectPropertyChange, WireChange,
};
use tokio::sync::Notify;

/// A connector-scoped static predicate: `is_included(property) -> bool`.
pub trait PropertyFilter: Send + Sync {
    fn is_included(&self, property: &PropertyReference) -> bool;
}

pub struct IncludeAll;
impl PropertyFilter for IncludeAll {
    fn is_included(&self, _property: &PropertyReference) -> bool {
        true
    }
}

struct Inner {
    fifo: VecDeque<SubjectPropertyChange>,
    structural_fifo: VecDeque<WireChange>,
}

/// Single-writer flush gate: a CAS-guarded boolean so only one flush runs
/// at a time, matching §4.G's description exactly.
struct FlushGate {
    busy: AtomicBool,
}

impl FlushGate {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct ChangeQueueProcessor {
    connector_id: ConnectorId,
    stream_id: StreamId,
    filter: Arc<dyn PropertyFilter>,
    buffer_time: Duration,
    inner: Mutex<Inner>,
    gate: FlushGate,
    flush_signal: Notify,
    next_seq: Mutex<SeqNo>,
}

impl ChangeQueueProcessor {
    pub fn new(
        connector_id: ConnectorId,
        stream_id: StreamId,
        filter: Arc<dyn PropertyFilter>,
        buffer_time: Duration,
    ) -> Self {
        Self {
            connector_id,
            stream_id,
            filter,
            buffer_time,
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                structural_fifo: VecDeque::new(),
            }),
            gate: FlushGate::new(),
            flush_signal: Notify::new(),
            next_seq: Mutex::new(SeqNo::ZERO),
        }
    }

    /// Returns `Some(batch)` immediately when the buffer window is zero
    /// (one-element batch delivered inline); otherwise enqueues and
    /// returns `None`.
    ///
    /// Filters out changes whose source is this connector (loop
    /// suppression, §4.I) and changes whose property the connector's
    /// filter excludes.
    pub fn enqueue(
        &self,
        change: SubjectPropertyChange,
    ) -> Option<Vec<SubjectPropertyChange>> {
        if change.is_from(&self.connector_id) {
            return None;
        }
        if !self.filter.is_included(&change.property_ref) {
            return None;
        }
        if self.buffer_time.is_zero() {
            return Some(vec![change]);
        }
        self.inner.lock().fifo.push_back(change);
        self.flush_signal.notify_one();
        None
    }

    /// Drains the FIFO, keeps only the most recent change per property
    /// (last-write-wins), and returns the retained set in ascending order
    /// of last occurrence. Returns `None` without draining if another
    /// flush is already in progress or nothing is pending.
    pub fn try_flush(&self) -> Option<Vec<SubjectPropertyChange>> {
        if !self.gate.try_acquire() {
            return None;
        }
        let drained: Vec<SubjectPropertyChange> = {
            let mut inner = self.inner.lock();
            inner.fifo.drain(..).collect()
        };
        self.gate.release();

        if drained.is_empty() {
            return None;
        }

        // Walk from the end; for each property, keep only the first
        // (i.e. most-recent) occurrence seen. Then restore ascending
        // order of last occurrence.
        let mut seen = std::collections::HashSet::new();
        let mut kept_reversed = Vec::with_capacity(drained.len());
        for change in drained.into_iter().rev() {
            if seen.insert(change.property_ref.clone()) {
                kept_reversed.push(change);
            }
        }
        kept_reversed.reverse();
        Some(kept_reversed)
    }

    /// Enqueues a structural change (subject added/removed/attached/detached)
    /// produced by the structural-change processor or an inbound
    /// attach/detach, to be included verbatim in the next flush alongside
    /// any buffered property changes. Unlike `enqueue`, the caller is
    /// responsible for loop suppression: structural changes carry no
    /// connector source of their own, so a connector must only route a
    /// structural change here when it didn't originate from that connector.
    pub fn enqueue_structural(&self, change: WireChange) {
        self.inner.lock().structural_fifo.push_back(change);
        self.flush_signal.notify_one();
    }

    fn drain_structural(&self) -> Vec<WireChange> {
        self.inner.lock().structural_fifo.drain(..).collect()
    }

    /// `try_flush`, stamped with this processor's outbound stream position
    /// -- the shape the connector transport actually sends.
    pub fn try_flush_stamped(&self) -> Option<PullChangesResponse> {
        self.try_flush_with_source().map(|(_, response)| response)
    }

    /// Same as `try_flush_stamped`, but also returns the original property
    /// changes so a failed send can requeue them for retry. Any pending
    /// structural changes are drained and stamped into the same batch, but
    /// are not returned for retry -- they are re-derived from subject state
    /// rather than requeued on send failure.
    pub fn try_flush_with_source(
        &self,
    ) -> Option<(Vec<SubjectPropertyChange>, PullChangesResponse)> {
        let structural = self.drain_structural();
        let changes = match self.try_flush() {
            Some(changes) => changes,
            None if !structural.is_empty() => Vec::new(),
            None => return None,
        };
        let response = self.stamp(&changes, structural);
        Some((changes, response))
    }

    /// Assigns the next run of sequence numbers to an already-drained batch
    /// of property changes plus any structural changes, in that order. Used
    /// both for a fresh flush and for re-sending a batch pulled back out of
    /// the write-retry queue -- a retried write still needs a wire-visible
    /// position in the stream.
    pub fn stamp(
        &self,
        changes: &[SubjectPropertyChange],
        structural: Vec<WireChange>,
    ) -> PullChangesResponse {
        let mut next_seq = self.next_seq.lock();
        let from_seq_no = *next_seq;
        let mut stamped: Vec<StampedChange> = changes
            .iter()
            .map(|change| {
                let seq_no = *next_seq;
                *next_seq = next_seq.next();
                StampedChange {
                    seq_no,
                    change: WireChange::from_property_change(change),
                }
            })
            .collect();
        stamped.extend(structural.into_iter().map(|change| {
            let seq_no = *next_seq;
            *next_seq = next_seq.next();
            StampedChange { seq_no, change }
        }));
        PullChangesResponse {
            stream_id: self.stream_id.clone(),
            from_seq_no,
            next_seq_no: *next_seq,
            changes: stamped,
            truncated: false,
        }
    }

    /// Resolves the next time something is enqueued. The connector's flush
    /// task races this against its buffer-time tick and the cancellation
    /// token.
    pub async fn wait_for_flush_signal(&self) {
        self.flush_signal.notified().await
    }

    pub fn buffer_time(&self) -> Duration {
        self.buffer_time
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().fifo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{PropertyValue, Source, StreamId, SubjectId};

    fn change(prop: &PropertyReference, value: i64) -> SubjectPropertyChange {
        SubjectPropertyChange::new(
            prop.clone(),
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(value.into()),
        )
    }

    #[test]
    fn dedup_last_wins_within_one_flush_window() {
        // scenario 3: p := 1; p := 2; p := 3; q := 9
        let processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        let subject = SubjectId::new();
        let p = PropertyReference::new(subject.clone(), 0, "p");
        let q = PropertyReference::new(subject, 1, "q");

        processor.enqueue(change(&p, 1));
        processor.enqueue(change(&p, 2));
        processor.enqueue(change(&p, 3));
        processor.enqueue(change(&q, 9));

        let batch = processor.try_flush().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].property_ref, p);
        assert_eq!(batch[0].new_value, PropertyValue::Scalar(3i64.into()));
        assert_eq!(batch[1].property_ref, q);
    }

    #[test]
    fn zero_buffer_time_delivers_immediately() {
        let processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::ZERO,
        );
        let p = PropertyReference::new(SubjectId::new(), 0, "p");
        let batch = processor.enqueue(change(&p, 1));
        assert_eq!(batch.unwrap().len(), 1);
        assert_eq!(processor.pending_len(), 0);
    }

    #[test]
    fn loop_suppression_drops_changes_from_own_connector() {
        // scenario 4: inbound event tagged source=K; connector K's
        // processor must drop it.
        let k = ConnectorId::new();
        let processor = ChangeQueueProcessor::new(
            k.clone(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        let p = PropertyReference::new(SubjectId::new(), 0, "p");
        let change = SubjectPropertyChange::new(
            p,
            Source::Connector(k),
            PropertyValue::Absent,
            PropertyValue::Scalar(7i64.into()),
        );
        assert!(processor.enqueue(change).is_none());
        assert_eq!(processor.pending_len(), 0);
        assert!(processor.try_flush().is_none());
    }

    #[test]
    fn another_connector_still_observes_the_change() {
        let k = ConnectorId::new();
        let l_processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        let p = PropertyReference::new(SubjectId::new(), 0, "p");
        let change = SubjectPropertyChange::new(
            p,
            Source::Connector(k),
            PropertyValue::Absent,
            PropertyValue::Scalar(7i64.into()),
        );
        l_processor.enqueue(change);
        let batch = l_processor.try_flush().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn stamped_flush_assigns_increasing_seq_numbers_across_flushes() {
        let processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        let p = PropertyReference::new(SubjectId::new(), 0, "p");
        processor.enqueue(change(&p, 1));
        let first = processor.try_flush_stamped().unwrap();
        assert_eq!(first.from_seq_no.value(), 0);
        assert_eq!(first.next_seq_no.value(), 1);

        processor.enqueue(change(&p, 2));
        let second = processor.try_flush_stamped().unwrap();
        assert_eq!(second.from_seq_no.value(), 1);
        assert_eq!(second.next_seq_no.value(), 2);
    }

    #[test]
    fn structural_changes_flush_alongside_property_changes() {
        let processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        let p = PropertyReference::new(SubjectId::new(), 0, "p");
        processor.enqueue(change(&p, 1));
        processor.enqueue_structural(WireChange::SubjectAttached {
            subject: SubjectId::new(),
        });

        let response = processor.try_flush_stamped().unwrap();
        assert_eq!(response.changes.len(), 2);
        assert!(matches!(
            response.changes[0].change,
            WireChange::PropertyChanged { .. }
        ));
        assert!(matches!(
            response.changes[1].change,
            WireChange::SubjectAttached { .. }
        ));
    }

    #[test]
    fn structural_changes_flush_even_with_no_pending_property_changes() {
        let processor = ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("opcua-primary"),
            Arc::new(IncludeAll),
            Duration::from_millis(8),
        );
        processor.enqueue_structural(WireChange::SubjectDetached {
            subject: SubjectId::new(),
        });
        let response = processor.try_flush_stamped().unwrap();
        assert_eq!(response.changes.len(), 1);
    }
}
