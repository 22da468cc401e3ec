//! The sync engine's runtime: registries, the interceptor chain, the
//! change bus, structural diffing, the per-connector change queue and
//! write-retry buffer, ambient source/timestamp scopes, and the connector
//! lifecycle loop.

pub mod bus;
pub mod connector;
pub mod context;
pub mod derived;
pub mod directory;
pub mod interceptors;
pub mod options;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod source;
pub mod structural;
pub mod subject;

pub use bus::{BusEvent, ChangeBus, QueueSubscription, Subscriber};
pub use connector::{
    BoxFuture, CancellationToken, ConnectorHandle, ConnectorHandler, ConnectorState,
    ConnectorTransport,
};
pub use context::{ContextAttachObserver, SubjectContext};
pub use derived::{record_read, reemit_dependents, DependencyTracker};
pub use directory::SubjectDirectory;
pub use interceptors::{Chain, InterceptorDescriptor, InterceptorPartition, ReadInterceptor};
pub use options::{ConnectorOptions, RuntimeOptions};
pub use pipeline::{apply_local_write, apply_structural_write, WriteContext};
pub use queue::{ChangeQueueProcessor, IncludeAll, PropertyFilter};
pub use registry::{RegistryLease, SubjectConnectorRegistry};
pub use retry::WriteRetryQueue;
pub use source::{current_changed_timestamp, current_source, WithChangedTimestamp, WithSource};
pub use structural::{BusStructuralSink, StructuralChangeProcessor, StructuralOp, StructuralSink};
pub use subject::{PropertyState, Subject, SubjectType};
