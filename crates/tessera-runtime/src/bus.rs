//! Change-notification bus (§4.D): property-change and lifecycle events,
//! fanned out to synchronous callbacks and queue subscriptions.

use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{SubjectLifecycleChange, SubjectPropertyChange};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    PropertyChanged(SubjectPropertyChange),
    SubjectAttached(SubjectLifecycleChange),
    SubjectDetached(SubjectLifecycleChange),
    ParentChanged(SubjectLifecycleChange),
}

/// A synchronous subscriber, invoked inline on the writing thread.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &BusEvent);
}

/// A cancellable dequeue handed out by `ChangeBus::subscribe_queue`
/// (§6 "SubscribePropertyChanges() -> queue"). Dropping it unsubscribes --
/// the bus prunes closed senders lazily on the next publish.
pub struct QueueSubscription {
    receiver: mpsc::UnboundedReceiver<BusEvent>,
}

impl QueueSubscription {
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking drain check: `Err` when nothing is buffered right now,
    /// without waiting for a future publish.
    pub fn try_recv(&mut self) -> Result<BusEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

struct Inner {
    sync_subscribers: Vec<Arc<dyn Subscriber>>,
    queue_senders: Vec<mpsc::UnboundedSender<BusEvent>>,
}

/// Provides a per-subscriber serialization point: `publish` holds a single
/// dispatch lock across the synchronous fan-out, so two threads racing to
/// publish never interleave their deliveries to the same subscriber. This
/// is coarser than strictly necessary (one lock rather than one per
/// subscriber) but satisfies the ordering guarantee in §5.
pub struct ChangeBus {
    inner: Mutex<Inner>,
    dispatch: Mutex<()>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sync_subscribers: Vec::new(),
                queue_senders: Vec::new(),
            }),
            dispatch: Mutex::new(()),
        }
    }

    pub fn subscribe_sync(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.lock().sync_subscribers.push(subscriber);
    }

    pub fn subscribe_queue(&self) -> QueueSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().queue_senders.push(tx);
        QueueSubscription { receiver: rx }
    }

    /// Within one thread, successive `publish` calls are observed by every
    /// subscriber in the order they were made.
    pub fn publish(&self, event: BusEvent) {
        let _dispatch_guard = self.dispatch.lock();
        let (subscribers, senders) = {
            let inner = self.inner.lock();
            (inner.sync_subscribers.clone(), inner.queue_senders.clone())
        };
        for subscriber in &subscribers {
            subscriber.on_event(&event);
        }
        if senders.is_empty() {
            return;
        }
        let mut dead = false;
        for sender in &senders {
            if sender.send(event.clone()).is_err() {
                dead = true;
            }
        }
        if dead {
            self.inner
                .lock()
                .queue_senders
                .retain(|s| !s.is_closed());
        }
    }

    pub fn property_changed(&self, change: SubjectPropertyChange) {
        self.publish(BusEvent::PropertyChanged(change));
    }

    pub fn subject_attached(&self, change: SubjectLifecycleChange) {
        self.publish(BusEvent::SubjectAttached(change));
    }

    pub fn subject_detached(&self, change: SubjectLifecycleChange) {
        self.publish(BusEvent::SubjectDetached(change));
    }

    pub fn parent_changed(&self, change: SubjectLifecycleChange) {
        self.publish(BusEvent::ParentChanged(change));
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{PropertyReference, PropertyValue, Source, SubjectId};

    struct Recorder(Mutex<Vec<BusEvent>>);

    impl Subscriber for Recorder {
        fn on_event(&self, event: &BusEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn sample_change() -> SubjectPropertyChange {
        SubjectPropertyChange::new(
            PropertyReference::new(SubjectId::new(), 0, "p"),
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(facet_value::Value::NULL),
        )
    }

    #[test]
    fn sync_subscriber_sees_events_in_publish_order() {
        let bus = ChangeBus::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.subscribe_sync(recorder.clone());

        bus.property_changed(sample_change());
        bus.property_changed(sample_change());

        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn queue_subscriber_receives_published_events() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe_queue();
        bus.property_changed(sample_change());
        let received = sub.recv().await;
        assert!(matches!(received, Some(BusEvent::PropertyChanged(_))));
    }
}
