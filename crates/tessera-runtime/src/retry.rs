//! Write-retry queue (§4.H): bounded FIFO retry of failed outbound writes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tessera_core::SubjectPropertyChange;
use tokio::sync::Semaphore;
use tracing::warn;

struct Inner {
    fifo: VecDeque<SubjectPropertyChange>,
    capacity: usize,
}

impl Inner {
    /// Drops oldest entries until `|fifo| + additional <= capacity`,
    /// logging the drop count (§7 band 3: data-loss events are never
    /// silently discarded).
    fn make_room(&mut self, additional: usize) {
        if self.capacity == 0 {
            return;
        }
        let overflow = (self.fifo.len() + additional).saturating_sub(self.capacity);
        if overflow == 0 {
            return;
        }
        let dropped = overflow.min(self.fifo.len());
        for _ in 0..dropped {
            self.fifo.pop_front();
        }
        warn!(
            dropped_count = dropped,
            capacity = self.capacity,
            "write-retry ring buffer overflowed, dropping oldest entries"
        );
    }
}

/// A bounded FIFO with capacity N; a single-flusher semaphore serializes
/// flushes, the queue itself is thread-safe via its own lock.
pub struct WriteRetryQueue {
    inner: Mutex<Inner>,
    flusher: Semaphore,
    max_batch_size: usize,
}

impl WriteRetryQueue {
    pub fn new(capacity: usize, max_batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            flusher: Semaphore::new(1),
            max_batch_size,
        }
    }

    /// Enqueues `changes`; if the queue would exceed capacity, the oldest
    /// entries are dropped first and the drop count is logged.
    pub fn enqueue(&self, changes: impl IntoIterator<Item = SubjectPropertyChange>) {
        let changes: Vec<_> = changes.into_iter().collect();
        if self.inner.lock().capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.make_room(changes.len());
        for change in changes {
            if inner.fifo.len() >= inner.capacity {
                inner.fifo.pop_front();
            }
            inner.fifo.push_back(change);
        }
    }

    /// Re-queues `changes` at the head (they failed again), making room by
    /// dropping from the tail if necessary.
    pub fn requeue_at_head(&self, changes: Vec<SubjectPropertyChange>) {
        let mut inner = self.inner.lock();
        inner.make_room(changes.len());
        for change in changes.into_iter().rev() {
            if inner.fifo.len() >= inner.capacity {
                inner.fifo.pop_back();
            }
            inner.fifo.push_front(change);
        }
    }

    /// Drains up to `max_batch_size` items for one flush attempt. Only one
    /// flush may run at a time; callers await `acquire_flush_permit`
    /// first.
    pub async fn acquire_flush_permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.flusher
            .acquire()
            .await
            .expect("write-retry flush semaphore is never closed")
    }

    pub fn drain_batch(&self) -> Vec<SubjectPropertyChange> {
        let mut inner = self.inner.lock();
        let take = self.max_batch_size.min(inner.fifo.len());
        inner.fifo.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{PropertyReference, PropertyValue, Source, SubjectId};

    fn change(n: i64) -> SubjectPropertyChange {
        SubjectPropertyChange::new(
            PropertyReference::new(SubjectId::new(), 0, "p"),
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(n.into()),
        )
    }

    #[test]
    fn overflow_drops_exactly_the_excess_oldest_items() {
        // scenario 5: capacity 4, enqueue 6 items -> 2 oldest dropped.
        let queue = WriteRetryQueue::new(4, 16);
        queue.enqueue((1..=6).map(change));
        assert_eq!(queue.len(), 4);
        let remaining = queue.drain_batch();
        // items 3..6 survive, in order.
        let expected: Vec<SubjectPropertyChange> = (3..=6).map(change).collect();
        for (got, want) in remaining.iter().zip(expected.iter()) {
            assert_eq!(got.new_value, want.new_value);
        }
    }

    #[test]
    fn zero_capacity_disables_buffering() {
        let queue = WriteRetryQueue::new(0, 16);
        queue.enqueue(vec![change(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_batch_respects_max_batch_size() {
        let queue = WriteRetryQueue::new(100, 2);
        queue.enqueue((1..=5).map(change));
        let batch = queue.drain_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 3);
    }
}
