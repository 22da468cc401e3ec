//! Facade over the subject/connector graph-sync engine.
//!
//! An application builds one [`SyncEngine`], registers its subjects with it,
//! roots contexts under [`SyncEngine::root_context`], subscribes to the
//! parts of the change stream it cares about, and assembles one
//! [`Connector`] per external system via [`ConnectorBuilder`]. Starting a
//! connector wires it all the way through: inbound wire messages are
//! applied to the subject graph via registry lookup and the write pipeline,
//! and local writes flow back out through the interceptor chain, the
//! change bus, and the connector's own outbound queue.

pub use tessera_core::{
    ConnectorError, ConnectorId, CoreError, ExternalId, LifecycleKind, PropertyKind,
    PropertyReference, PropertyValue, PullChangesRequest, PullChangesResponse, SeqNo, Source,
    SubjectLifecycleChange, SubjectPropertyChange, SubjectPropertyMetadata, SubjectId, StreamId,
    SubjectTypeMetadata, Timestamp, TimestampMillis, WireChange,
};
pub use tessera_runtime::{
    apply_local_write, apply_structural_write, record_read, reemit_dependents, BoxFuture,
    BusEvent, BusStructuralSink, CancellationToken, Chain, ChangeBus, ChangeQueueProcessor,
    ConnectorHandle, ConnectorHandler, ConnectorOptions, ConnectorState, ConnectorTransport,
    ContextAttachObserver, DependencyTracker, IncludeAll, InterceptorDescriptor,
    InterceptorPartition, PropertyFilter, PropertyState, QueueSubscription, ReadInterceptor,
    RegistryLease, RuntimeOptions, StructuralChangeProcessor, StructuralOp, StructuralSink,
    Subject, SubjectConnectorRegistry, SubjectContext, SubjectDirectory, SubjectType, Subscriber,
    WithChangedTimestamp, WithSource, WriteContext, WriteRetryQueue,
};
pub use tessera_wire::{
    EngineMessage, Handshake, RemoteMessage, WireError, WriteBatch, WriteResult,
};

use std::sync::Arc;
use tracing::warn;

/// One application-wide sync engine: the change bus every subject context
/// publishes into, the subject directory the write pipeline dispatches
/// through, the interceptor chain every write (local or connector-driven)
/// passes through, and the default options new connectors inherit.
///
/// Subjects are rooted by the application, not owned here (§3 "Ownership"):
/// the engine only holds the bus and a process-wide root context other
/// contexts can fall back to. A subject must still be registered with
/// [`SyncEngine::register_subject`] before the write pipeline or a
/// connector's inbound handler can reach it by id.
pub struct SyncEngine {
    bus: Arc<ChangeBus>,
    root_context: Arc<SubjectContext>,
    options: RuntimeOptions,
    directory: Arc<SubjectDirectory>,
    chain: Arc<Chain<WriteContext>>,
    tracker: Arc<DependencyTracker>,
}

impl SyncEngine {
    pub fn new(options: RuntimeOptions) -> Arc<Self> {
        Self::with_interceptors(options, Vec::new())
            .expect("an empty interceptor chain cannot contain a cycle")
    }

    /// As `new`, but with an explicit write-interceptor chain (§4.C). The
    /// chain runs on every local or connector-driven write, in front of
    /// `Subject::write_raw`.
    pub fn with_interceptors(
        options: RuntimeOptions,
        interceptors: Vec<Arc<dyn ReadInterceptor<WriteContext>>>,
    ) -> Result<Arc<Self>, CoreError> {
        let chain = Chain::build(interceptors)?;
        Ok(Arc::new(Self {
            bus: Arc::new(ChangeBus::new()),
            root_context: SubjectContext::new(),
            options,
            directory: Arc::new(SubjectDirectory::new()),
            chain: Arc::new(chain),
            tracker: Arc::new(DependencyTracker::new()),
        }))
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn root_context(&self) -> &Arc<SubjectContext> {
        &self.root_context
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn directory(&self) -> &Arc<SubjectDirectory> {
        &self.directory
    }

    /// Registers a subject so the write pipeline and connector inbound
    /// handlers can look it up by id. Does not attach it to any parent --
    /// that's a structural write on whatever property holds it.
    pub fn register_subject(&self, subject: Arc<dyn Subject>) {
        self.directory.insert(subject);
    }

    pub fn unregister_subject(&self, subject: &SubjectId) -> Option<Arc<dyn Subject>> {
        self.directory.remove(subject)
    }

    /// Writes a plain value property (§2's local-write path): runs the
    /// interceptor chain, persists, publishes, and re-emits dependents.
    /// Tagged with whatever `WithSource`/`WithChangedTimestamp` scope the
    /// caller has established, or `Source::Local`/`Timestamp::Unset` if
    /// none is active.
    pub fn write_property(
        &self,
        subject: Arc<dyn Subject>,
        ordinal: u32,
        new_value: PropertyValue,
    ) -> Result<(), CoreError> {
        apply_local_write(
            &self.chain,
            &self.bus,
            &self.tracker,
            subject,
            ordinal,
            new_value,
            current_source(),
            current_changed_timestamp(),
        )
    }

    /// Writes a reference/collection/dictionary property (§2's structural
    /// path): runs the interceptor chain, diffs old against new, dispatches
    /// the resulting adds/removes through `sink`, and cascades the teardown
    /// of anything removed. `sink` is typically a [`BusStructuralSink`]
    /// wrapping this engine's own bus.
    pub async fn write_structural_property(
        &self,
        sink: &dyn StructuralSink,
        subject: Arc<dyn Subject>,
        ordinal: u32,
        new_value: PropertyValue,
    ) -> Result<(), CoreError> {
        let connector_options = &self.options.default_connector;
        apply_structural_write(
            &self.chain,
            &self.bus,
            &self.directory,
            sink,
            subject,
            ordinal,
            new_value,
            current_source(),
            current_changed_timestamp(),
            connector_options.propagate_reorders,
            connector_options.max_nesting_depth,
        )
        .await
    }

    /// Subscribes to `PropertyChanged` events only, discarding lifecycle
    /// noise -- the shape a change-queue processor actually wants
    /// (§6 "SubscribeToPropertyChanges() -> subscription").
    pub fn subscribe_property_changes(&self) -> PropertyChangeSubscription {
        PropertyChangeSubscription {
            inner: self.bus.subscribe_queue(),
        }
    }

    /// Subscribes to `SubjectAttached`/`SubjectDetached`/`ParentChanged`
    /// only.
    pub fn subscribe_lifecycle(&self) -> LifecycleSubscription {
        LifecycleSubscription {
            inner: self.bus.subscribe_queue(),
        }
    }
}

/// A `ChangeBus` queue subscription filtered down to value-property
/// changes.
pub struct PropertyChangeSubscription {
    inner: QueueSubscription,
}

impl PropertyChangeSubscription {
    pub async fn recv(&mut self) -> Option<SubjectPropertyChange> {
        loop {
            match self.inner.recv().await? {
                BusEvent::PropertyChanged(change) => return Some(change),
                _ => continue,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Attached(SubjectLifecycleChange),
    Detached(SubjectLifecycleChange),
    ParentChanged(SubjectLifecycleChange),
}

/// A `ChangeBus` queue subscription filtered down to lifecycle events.
pub struct LifecycleSubscription {
    inner: QueueSubscription,
}

impl LifecycleSubscription {
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            return Some(match self.inner.recv().await? {
                BusEvent::SubjectAttached(change) => LifecycleEvent::Attached(change),
                BusEvent::SubjectDetached(change) => LifecycleEvent::Detached(change),
                BusEvent::ParentChanged(change) => LifecycleEvent::ParentChanged(change),
                BusEvent::PropertyChanged(_) => continue,
            });
        }
    }

    /// Non-blocking drain check, used by tests to assert nothing was
    /// forwarded rather than waiting for a timeout.
    pub fn try_recv(&mut self) -> Result<LifecycleEvent, tokio::sync::mpsc::error::TryRecvError> {
        loop {
            return match self.inner.try_recv()? {
                BusEvent::SubjectAttached(change) => Ok(LifecycleEvent::Attached(change)),
                BusEvent::SubjectDetached(change) => Ok(LifecycleEvent::Detached(change)),
                BusEvent::ParentChanged(change) => Ok(LifecycleEvent::ParentChanged(change)),
                BusEvent::PropertyChanged(_) => continue,
            };
        }
    }
}

/// Applies inbound `RemoteMessage`s to the engine's subject graph
/// (§2 "inbound remote event -> connector -> registry lookup -> local
/// mutation"). Every change applied here is tagged with this connector's
/// own `Source`, so the outbound forwarder never echoes it back.
struct EngineConnectorHandler<D: Clone + Send + 'static> {
    connector_id: ConnectorId,
    engine: Arc<SyncEngine>,
    registry: Arc<SubjectConnectorRegistry<D>>,
    sink: Arc<BusStructuralSink>,
}

impl<D: Clone + Send + 'static> ConnectorHandler for EngineConnectorHandler<D> {
    fn on_remote_message<'a>(&'a self, message: RemoteMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _source_scope = WithSource::new(Source::Connector(self.connector_id.clone()));
            match message {
                RemoteMessage::WriteBatch(batch) => {
                    for change in batch.changes {
                        self.apply_inbound(change).await;
                    }
                }
                RemoteMessage::PullRequest(_) => {
                    // This handler only applies inbound pushes; a pull
                    // request is served by the connector's own outbound
                    // flush loop.
                }
            }
        })
    }
}

impl<D: Clone + Send + 'static> EngineConnectorHandler<D> {
    async fn apply_inbound(&self, change: WireChange) {
        match change {
            WireChange::PropertyChanged {
                subject,
                ordinal,
                new_value,
                ..
            } => {
                if self.registry.try_get_external_id(&subject).is_none() {
                    warn!(subject = %subject, "inbound change for a subject this connector does not track");
                    return;
                }
                let Some(target) = self.engine.directory().get(&subject) else {
                    warn!(subject = %subject, "inbound change for an unregistered subject");
                    return;
                };
                if let Err(err) = self.engine.write_property(target, ordinal, new_value) {
                    warn!(subject = %subject, error = %err, "inbound write rejected");
                }
            }
            WireChange::StructuralAdded {
                subject,
                property,
                index,
                child,
            } => {
                self.apply_inbound_structural(subject, property, index, child, true)
                    .await;
            }
            WireChange::StructuralRemoved {
                subject,
                property,
                index,
                child,
            } => {
                self.apply_inbound_structural(subject, property, index, child, false)
                    .await;
            }
            WireChange::SubjectAttached { .. } | WireChange::SubjectDetached { .. } => {
                // Only ever emitted by this engine's own structural sink,
                // never sent by the remote side.
            }
        }
    }

    async fn apply_inbound_structural(
        &self,
        subject: SubjectId,
        property: String,
        index: Option<u32>,
        child: SubjectId,
        added: bool,
    ) {
        if self.registry.try_get_external_id(&subject).is_none() {
            warn!(subject = %subject, "inbound structural change for a subject this connector does not track");
            return;
        }
        let Some(target) = self.engine.directory().get(&subject) else {
            warn!(subject = %subject, "inbound structural change for an unregistered subject");
            return;
        };
        let ordinal = target
            .type_metadata()
            .property(&property)
            .map(|meta| meta.ordinal)
            .unwrap_or(0);
        let property_ref = PropertyReference::new(subject, ordinal, property);
        if added {
            self.sink.on_subject_added(&property_ref, &child, index).await;
        } else {
            self.sink
                .on_subject_removed(&property_ref, &child, index)
                .await;
        }
    }
}

/// Forwards bus events outward onto one connector's change queue
/// (§2 "interceptor chain -> bus -> queue filters own-source changes").
/// Property changes are loop-suppressed by `ChangeQueueProcessor::enqueue`
/// itself; lifecycle events are only forwarded for subjects this connector
/// actually tracks, since they carry no connector source of their own.
fn spawn_outbound_forwarder<D: Clone + Send + 'static>(
    bus: Arc<ChangeBus>,
    registry: Arc<SubjectConnectorRegistry<D>>,
    queue: Arc<ChangeQueueProcessor>,
    cancellation: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe_queue();
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return,
                event = subscription.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        BusEvent::PropertyChanged(change) => {
                            let _ = queue.enqueue(change);
                        }
                        BusEvent::SubjectAttached(change) => {
                            if registry.try_get_external_id(&change.subject).is_some() {
                                queue.enqueue_structural(WireChange::SubjectAttached {
                                    subject: change.subject,
                                });
                            }
                        }
                        BusEvent::SubjectDetached(change) => {
                            if registry.try_get_external_id(&change.subject).is_some() {
                                queue.enqueue_structural(WireChange::SubjectDetached {
                                    subject: change.subject,
                                });
                            }
                        }
                        BusEvent::ParentChanged(_) => {}
                    }
                }
            }
        }
    })
}

/// Assembles one connector's registry, change-queue processor and
/// write-retry buffer out of a `ConnectorOptions`. `D` is the connector's
/// own per-subject registry payload (e.g. a remote node-id cache entry).
pub struct ConnectorBuilder<D> {
    engine: Arc<SyncEngine>,
    id: ConnectorId,
    stream_id: StreamId,
    options: ConnectorOptions,
    filter: Arc<dyn PropertyFilter>,
    _data: std::marker::PhantomData<D>,
}

impl<D: Clone + Send + 'static> ConnectorBuilder<D> {
    pub fn new(
        engine: Arc<SyncEngine>,
        id: ConnectorId,
        stream_id: StreamId,
        options: ConnectorOptions,
    ) -> Self {
        Self {
            engine,
            id,
            stream_id,
            options,
            filter: Arc::new(IncludeAll),
            _data: std::marker::PhantomData,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn PropertyFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn build(self) -> Connector<D> {
        let registry = SubjectConnectorRegistry::new(self.options.recently_deleted_ttl());
        let queue = Arc::new(ChangeQueueProcessor::new(
            self.id.clone(),
            self.stream_id,
            self.filter,
            self.options.buffer_time(),
        ));
        let retry = Arc::new(WriteRetryQueue::new(
            self.options.max_queue_size,
            self.options.max_batch_size,
        ));
        Connector {
            engine: self.engine,
            id: self.id,
            options: self.options,
            registry,
            queue,
            retry,
        }
    }
}

/// One connector's assembled state: registry, outbound change queue and
/// write-retry buffer, ready to be started against a transport.
pub struct Connector<D> {
    engine: Arc<SyncEngine>,
    id: ConnectorId,
    options: ConnectorOptions,
    registry: Arc<SubjectConnectorRegistry<D>>,
    queue: Arc<ChangeQueueProcessor>,
    retry: Arc<WriteRetryQueue>,
}

impl<D: Clone + Send + 'static> Connector<D> {
    pub fn id(&self) -> &ConnectorId {
        &self.id
    }

    pub fn registry(&self) -> &Arc<SubjectConnectorRegistry<D>> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<ChangeQueueProcessor> {
        &self.queue
    }

    pub fn retry(&self) -> &Arc<WriteRetryQueue> {
        &self.retry
    }

    /// Starts the connector's background lifecycle task (§4.J) and its
    /// outbound bus forwarder: connect, listen (applying inbound messages
    /// through the registry and the write pipeline), flush outbound
    /// changes, retry on failure.
    pub fn start(&self, transport: Box<dyn ConnectorTransport>) -> StartedConnector {
        let sink = Arc::new(BusStructuralSink::new(self.engine.bus().clone()));
        let handler: Arc<dyn ConnectorHandler> = Arc::new(EngineConnectorHandler {
            connector_id: self.id.clone(),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            sink,
        });

        let handle = tessera_runtime::connector::spawn(
            self.id.clone(),
            self.options.clone(),
            transport,
            handler,
            self.queue.clone(),
            self.retry.clone(),
        );

        let forwarder = spawn_outbound_forwarder(
            self.engine.bus().clone(),
            self.registry.clone(),
            self.queue.clone(),
            handle.cancellation_token(),
        );

        StartedConnector { handle, forwarder }
    }
}

/// A running connector: its lifecycle loop plus its outbound bus forwarder.
/// `shutdown` cancels and awaits both.
pub struct StartedConnector {
    handle: ConnectorHandle,
    forwarder: tokio::task::JoinHandle<()>,
}

impl StartedConnector {
    pub fn id(&self) -> &ConnectorId {
        self.handle.id()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancellation_token()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        let _ = self.forwarder.await;
    }
}

fn current_source() -> Source {
    tessera_runtime::current_source()
}

fn current_changed_timestamp() -> Timestamp {
    tessera_runtime::current_changed_timestamp()
}
