//! Capability contracts: handlers, receivers, publishers, type registries and
//! metrics sinks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cqrs_events::{PayloadShape, VersionedEvent};
use tokio::sync::{mpsc, oneshot};

use crate::error::RegistryError;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Processes one received event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &VersionedEvent) -> Result<()>;
}

/// Adapter for synchronous closures. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&VersionedEvent) -> Result<()> + Send + Sync,
{
    async fn handle(&self, event: &VersionedEvent) -> Result<()> {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&VersionedEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Transport contracts
// ---------------------------------------------------------------------------

/// Pulls events from a transport and feeds them to `options.receive_event`.
///
/// Implementations must:
/// - keep feeding events until a [`CloseRequest`] arrives on `options.close`,
///   then stop delivery and answer on the request;
/// - report transport failures on `options.errors` without stopping.
#[async_trait]
pub trait VersionedEventReceiver: Send + Sync {
    async fn receive_events(&self, options: ReceiverOptions) -> Result<()>;
}

/// Pushes events to a transport. A batch is accepted or rejected as a whole.
#[async_trait]
pub trait VersionedEventPublisher: Send + Sync {
    async fn publish_events(&self, events: Vec<VersionedEvent>) -> Result<()>;
}

/// A transport that both publishes and receives.
pub trait EventBus: VersionedEventPublisher + VersionedEventReceiver {}

impl<T: VersionedEventPublisher + VersionedEventReceiver> EventBus for T {}

/// Maps stable event-type names to payload types so receivers can decode
/// incoming payloads.
pub trait TypeRegistry: Send + Sync {
    /// Record a payload shape. Registering the same shape twice is a no-op.
    fn register_type(&self, shape: PayloadShape) -> Result<(), RegistryError>;

    fn get_type_by_name(&self, name: &str) -> Option<PayloadShape>;

    fn type_names(&self) -> Vec<&'static str>;
}

/// Counters incremented by the dispatcher, keyed by event-type name.
pub trait DispatchMetrics: Send + Sync {
    fn event_dispatched(&self, event_type: &str);
    fn event_failed(&self, event_type: &str);
}

// ---------------------------------------------------------------------------
// Receiver options and the close handshake
// ---------------------------------------------------------------------------

/// Everything a receiver needs for one listen session.
pub struct ReceiverOptions {
    pub type_registry: Arc<dyn TypeRegistry>,
    /// Close requests from the dispatch manager.
    pub close: mpsc::Receiver<CloseRequest>,
    /// Transport failures reported back to the dispatch manager.
    pub errors: mpsc::Sender<anyhow::Error>,
    /// Bridge into the dispatch table.
    pub receive_event: Arc<dyn EventHandler>,
    /// Whether this receiver must be the only one attached to its transport.
    pub exclusive: bool,
    pub listener_count: usize,
}

/// A request to stop receiving. Carries the single-use channel the receiver
/// answers on once delivery has halted.
#[derive(Debug)]
pub struct CloseRequest {
    ack: oneshot::Sender<Result<()>>,
}

impl CloseRequest {
    pub fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (ack, answer) = oneshot::channel();
        (Self { ack }, answer)
    }

    /// Answer the requester. Consumes the request: it can be answered once.
    pub fn acknowledge(self, result: Result<()>) {
        if self.ack.send(result).is_err() {
            tracing::debug!("Close requester went away before the acknowledgement");
        }
    }
}
