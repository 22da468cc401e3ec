//! Connector lifecycle (§4.J): connect, listen, process, retry on failure.

use crate::options::ConnectorOptions;
use crate::queue::ChangeQueueProcessor;
use crate::retry::WriteRetryQueue;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_core::{ConnectorError, ConnectorId};
use tessera_wire::{EngineMessage, RemoteMessage};
use tracing::{debug, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A transport abstraction over one connector's wire link, independent of
/// the concrete network stack (TCP today, something else tomorrow).
pub trait ConnectorTransport: Send {
    fn connect<'a>(&'a mut self) -> BoxFuture<'a, Result<(), ConnectorError>>;
    fn send<'a>(&'a mut self, message: &'a EngineMessage) -> BoxFuture<'a, Result<(), ConnectorError>>;
    fn recv<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<RemoteMessage>, ConnectorError>>;
}

/// Applies an inbound `WriteBatch`/`PullRequest` to the subject graph.
/// Implemented by the runtime facade, which has access to registries and
/// subject contexts this crate's lower layers don't know about.
pub trait ConnectorHandler: Send + Sync {
    fn on_remote_message<'a>(&'a self, message: RemoteMessage) -> BoxFuture<'a, ()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorState {
    Starting,
    Initializing,
    Running,
    Draining,
    Retrying,
    Stopped,
}

/// A small hand-rolled cooperative cancellation handle: an `AtomicBool`
/// flag plus a `Notify` to wake anyone awaiting it. Every suspension point
/// in the connector loop races against `cancelled()`.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once `cancel()` has been called; resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A running connector: owns the cancellation token and the background
/// task's `JoinHandle`. Dropping the handle does not stop the loop --
/// call `shutdown` for cooperative, awaitable termination.
pub struct ConnectorHandle {
    id: ConnectorId,
    cancellation: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn id(&self) -> &ConnectorId {
        &self.id
    }

    /// Requests cancellation and awaits the background task's exit. Per
    /// the cancellation-promptness property, this must return within a
    /// bounded grace period once every suspension point has observed the
    /// token.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        let _ = self.task.await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Spawns the connector's background lifecycle loop on the current tokio
/// runtime and returns a handle to control it.
pub fn spawn(
    id: ConnectorId,
    options: ConnectorOptions,
    transport: Box<dyn ConnectorTransport>,
    handler: Arc<dyn ConnectorHandler>,
    queue: Arc<ChangeQueueProcessor>,
    retry: Arc<WriteRetryQueue>,
) -> ConnectorHandle {
    let cancellation = CancellationToken::new();
    let loop_cancellation = cancellation.clone();
    let loop_id = id.clone();
    let task = tokio::spawn(async move {
        run_lifecycle_loop(
            loop_id,
            options,
            transport,
            handler,
            queue,
            retry,
            loop_cancellation,
        )
        .await;
    });
    ConnectorHandle {
        id,
        cancellation,
        task,
    }
}

/// Sends one outbound batch, preferring retried writes over fresh ones so
/// the stream doesn't race ahead of changes that already failed once.
/// Anything the transport rejects is requeued at the retry head.
async fn flush_outbound(
    id: &ConnectorId,
    transport: &mut Box<dyn ConnectorTransport>,
    queue: &ChangeQueueProcessor,
    retry: &WriteRetryQueue,
) {
    if !retry.is_empty() {
        let _permit = retry.acquire_flush_permit().await;
        let batch = retry.drain_batch();
        if !batch.is_empty() {
            debug!(connector_id = %id, batch_len = batch.len(), "retrying buffered writes");
            let response = queue.stamp(&batch, Vec::new());
            let message = EngineMessage::DeltaBatch(response);
            if let Err(err) = transport.send(&message).await {
                warn!(connector_id = %id, error = %err, "retried batch failed again, re-buffering");
                retry.requeue_at_head(batch);
            }
        }
    }

    let Some((changes, response)) = queue.try_flush_with_source() else {
        return;
    };
    let message = EngineMessage::DeltaBatch(response);
    if let Err(err) = transport.send(&message).await {
        warn!(connector_id = %id, error = %err, "outbound flush failed, buffering for retry");
        retry.enqueue(changes);
    }
}

async fn run_lifecycle_loop(
    id: ConnectorId,
    options: ConnectorOptions,
    mut transport: Box<dyn ConnectorTransport>,
    handler: Arc<dyn ConnectorHandler>,
    queue: Arc<ChangeQueueProcessor>,
    retry: Arc<WriteRetryQueue>,
    cancellation: CancellationToken,
) {
    let mut state = ConnectorState::Starting;
    loop {
        state = match state {
            ConnectorState::Starting => ConnectorState::Initializing,
            ConnectorState::Initializing => {
                debug!(connector_id = %id, "connector initializing");
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => ConnectorState::Draining,
                    result = transport.connect() => match result {
                        Ok(()) => {
                            info!(connector_id = %id, "connector connected");
                            ConnectorState::Running
                        }
                        Err(err) => {
                            warn!(connector_id = %id, error = %err, "connector failed to connect");
                            ConnectorState::Retrying
                        }
                    },
                }
            }
            ConnectorState::Running => {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => ConnectorState::Draining,
                    result = transport.recv() => match result {
                        Ok(Some(message)) => {
                            handler.on_remote_message(message).await;
                            ConnectorState::Running
                        }
                        Ok(None) => {
                            info!(connector_id = %id, "connector transport closed");
                            ConnectorState::Retrying
                        }
                        Err(err) => {
                            warn!(connector_id = %id, error = %err, "connector transport failed");
                            ConnectorState::Retrying
                        }
                    },
                    _ = queue.wait_for_flush_signal() => {
                        tokio::time::sleep(queue.buffer_time()).await;
                        flush_outbound(&id, &mut transport, &queue, &retry).await;
                        ConnectorState::Running
                    }
                    _ = tokio::time::sleep(options.retry_time()), if !retry.is_empty() => {
                        flush_outbound(&id, &mut transport, &queue, &retry).await;
                        ConnectorState::Running
                    }
                }
            }
            ConnectorState::Retrying => {
                info!(
                    connector_id = %id,
                    retry_time_ms = options.retry_time_ms,
                    "connector retrying after backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => ConnectorState::Draining,
                    _ = tokio::time::sleep(options.retry_time()) => ConnectorState::Initializing,
                }
            }
            ConnectorState::Draining => {
                debug!(connector_id = %id, "connector draining");
                ConnectorState::Stopped
            }
            ConnectorState::Stopped => {
                info!(connector_id = %id, "connector stopped");
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::IncludeAll;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tessera_core::{PropertyReference, PropertyValue, Source, StreamId, SubjectId, SubjectPropertyChange};
    use tokio::sync::Mutex as AsyncMutex;

    fn test_queue() -> Arc<ChangeQueueProcessor> {
        Arc::new(ChangeQueueProcessor::new(
            ConnectorId::new(),
            StreamId::new("test-stream"),
            Arc::new(IncludeAll),
            Duration::from_millis(1),
        ))
    }

    fn test_retry() -> Arc<WriteRetryQueue> {
        Arc::new(WriteRetryQueue::new(64, 64))
    }

    struct ScriptedTransport {
        connect_result: Option<Result<(), ConnectorError>>,
        messages: AsyncMutex<std::collections::VecDeque<Option<RemoteMessage>>>,
    }

    impl ConnectorTransport for ScriptedTransport {
        fn connect<'a>(&'a mut self) -> BoxFuture<'a, Result<(), ConnectorError>> {
            let result = self
                .connect_result
                .take()
                .unwrap_or(Err(ConnectorError::TransportFailed("exhausted".into())));
            Box::pin(async move { result })
        }

        fn send<'a>(&'a mut self, _message: &'a EngineMessage) -> BoxFuture<'a, Result<(), ConnectorError>> {
            Box::pin(async { Ok(()) })
        }

        fn recv<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<RemoteMessage>, ConnectorError>> {
            Box::pin(async move {
                let mut messages = self.messages.lock().await;
                Ok(messages.pop_front().flatten())
            })
        }
    }

    struct CountingHandler {
        count: AtomicUsize,
    }

    impl ConnectorHandler for CountingHandler {
        fn on_remote_message<'a>(&'a self, _message: RemoteMessage) -> BoxFuture<'a, ()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn cancellation_during_retry_backoff_terminates_promptly() {
        let mut options = ConnectorOptions::default();
        options.retry_time_ms = 60_000;
        let transport: Box<dyn ConnectorTransport> = Box::new(ScriptedTransport {
            connect_result: Some(Err(ConnectorError::TransportFailed("refused".into()))),
            messages: AsyncMutex::new(std::collections::VecDeque::new()),
        });
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });

        let handle = spawn(
            ConnectorId::new(),
            options,
            transport,
            handler,
            test_queue(),
            test_retry(),
        );
        // Let the loop reach the retry backoff before cancelling.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let start = tokio::time::Instant::now();
        handle.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancellation_token_resolves_immediately_once_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    struct FailingSendTransport;

    impl ConnectorTransport for FailingSendTransport {
        fn connect<'a>(&'a mut self) -> BoxFuture<'a, Result<(), ConnectorError>> {
            Box::pin(async { Ok(()) })
        }

        fn send<'a>(
            &'a mut self,
            _message: &'a EngineMessage,
        ) -> BoxFuture<'a, Result<(), ConnectorError>> {
            Box::pin(async { Err(ConnectorError::TransportFailed("write refused".into())) })
        }

        fn recv<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<RemoteMessage>, ConnectorError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn enqueued_change_that_fails_to_send_lands_in_the_retry_queue() {
        let options = ConnectorOptions::default();
        let transport: Box<dyn ConnectorTransport> = Box::new(FailingSendTransport);
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let queue = test_queue();
        let retry = test_retry();

        queue.enqueue(SubjectPropertyChange::new(
            PropertyReference::new(SubjectId::new(), 0, "p"),
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(1i64.into()),
        ));

        let handle = spawn(
            ConnectorId::new(),
            options,
            transport,
            handler,
            queue,
            retry.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(retry.len(), 1);
    }

    #[tokio::test]
    async fn buffered_retry_batch_is_resent_and_drained_once_the_transport_recovers() {
        let mut options = ConnectorOptions::default();
        options.retry_time_ms = 5;
        let transport: Box<dyn ConnectorTransport> = Box::new(ScriptedTransport {
            connect_result: Some(Ok(())),
            messages: AsyncMutex::new(std::collections::VecDeque::new()),
        });
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let queue = test_queue();
        let retry = test_retry();
        retry.enqueue(vec![SubjectPropertyChange::new(
            PropertyReference::new(SubjectId::new(), 0, "p"),
            Source::Local,
            PropertyValue::Absent,
            PropertyValue::Scalar(1i64.into()),
        )]);

        let handle = spawn(
            ConnectorId::new(),
            options,
            transport,
            handler,
            queue,
            retry.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert!(retry.is_empty(), "a successful resend must drain the retry queue");
    }
}
