//! Dispatch manager: wires a receiver into the dispatch table and runs the
//! listen lifecycle.
//!
//! ```text
//! Idle → Starting → Listening → Stopping → Stopped
//!           │            ↺ error report
//!           └─ receiver start failed (returned to caller)
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cqrs_events::{EventKind, PayloadShape, VersionedEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::MapEventDispatcher;
use crate::error::{DispatchError, ListenError};
use crate::metrics::CounterMetrics;
use crate::traits::{
    CloseRequest, DispatchMetrics, EventHandler, ReceiverOptions, TypeRegistry,
    VersionedEventReceiver,
};

/// Per-listen settings handed through to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    pub exclusive: bool,
    pub listener_count: usize,
    /// Buffer size of the close and error channels.
    pub channel_capacity: usize,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            exclusive: false,
            listener_count: 1,
            channel_capacity: 1,
        }
    }
}

/// Lifecycle of one listen session.
///
/// `Idle` and `Starting` are passed through inside [`EventDispatchManager::listen`]
/// before a [`ListenHandle`] exists, so a handle only ever observes
/// `Listening`, `Stopping` and `Stopped`. A receiver that fails to start
/// yields an error instead of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Starting,
    Listening,
    Stopping,
    /// Terminal. The monitor has exited; later signals go nowhere.
    Stopped,
}

// ---------------------------------------------------------------------------
// EventDispatchManager
// ---------------------------------------------------------------------------

/// Coordinates receiving events from a receiver and dispatching them to the
/// internal dispatch table.
pub struct EventDispatchManager {
    dispatcher: Arc<MapEventDispatcher>,
    type_registry: Arc<dyn TypeRegistry>,
    receiver: Arc<dyn VersionedEventReceiver>,
}

impl EventDispatchManager {
    pub fn new(
        receiver: Arc<dyn VersionedEventReceiver>,
        type_registry: Arc<dyn TypeRegistry>,
    ) -> Self {
        Self::with_metrics(receiver, type_registry, Arc::new(CounterMetrics::new()))
    }

    pub fn with_metrics(
        receiver: Arc<dyn VersionedEventReceiver>,
        type_registry: Arc<dyn TypeRegistry>,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(MapEventDispatcher::with_metrics(metrics)),
            type_registry,
            receiver,
        }
    }

    /// The internal dispatch table.
    pub fn dispatcher(&self) -> &MapEventDispatcher {
        &self.dispatcher
    }

    /// Register `handler` for payloads of type `T`, recording `T` with the
    /// type registry so receivers can decode it.
    ///
    /// Either both registrations happen or neither does. Fails with
    /// [`DispatchError::RegistrationClosed`] while a receiver holds the
    /// dispatch table.
    pub fn register_event_handler<T: EventKind>(
        &mut self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), DispatchError> {
        let dispatcher = Arc::get_mut(&mut self.dispatcher).ok_or_else(|| {
            DispatchError::RegistrationClosed {
                event_type: T::EVENT_TYPE.to_string(),
            }
        })?;
        self.type_registry.register_type(PayloadShape::of::<T>())?;
        dispatcher.register_event_handler(T::EVENT_TYPE, handler);
        Ok(())
    }

    /// Register a handler that runs for every event. Fails with
    /// [`DispatchError::GlobalRegistrationClosed`] while a receiver holds the
    /// dispatch table.
    pub fn register_global_handler(
        &mut self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), DispatchError> {
        let dispatcher = Arc::get_mut(&mut self.dispatcher)
            .ok_or(DispatchError::GlobalRegistrationClosed)?;
        dispatcher.register_global_handler(handler);
        Ok(())
    }

    /// Start the receiver and a background monitor for this listen session.
    ///
    /// Returns once the receiver has started. The monitor then logs error
    /// reports until `stop` fires (or its sender is dropped), performs one
    /// close handshake with the receiver and exits.
    pub async fn listen(
        &self,
        stop: oneshot::Receiver<()>,
        options: ListenOptions,
    ) -> Result<ListenHandle> {
        let (state, state_rx) = watch::channel(ListenState::Idle);
        transition(&state, ListenState::Starting);

        let capacity = options.channel_capacity.max(1);
        let (close_tx, close_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(capacity);

        let bridge = Arc::new(DispatchBridge {
            dispatcher: self.dispatcher.clone(),
        });

        let started = self
            .receiver
            .receive_events(ReceiverOptions {
                type_registry: self.type_registry.clone(),
                close: close_rx,
                errors: error_tx,
                receive_event: bridge,
                exclusive: options.exclusive,
                listener_count: options.listener_count,
            })
            .await;
        if let Err(e) = started {
            warn!(error = %e, "Receiver failed to start");
            return Err(e);
        }

        info!(
            exclusive = options.exclusive,
            listener_count = options.listener_count,
            "EventDispatchManager listening"
        );
        transition(&state, ListenState::Listening);

        let monitor = Monitor {
            stop,
            close: close_tx,
            errors: error_rx,
            errors_open: true,
            state,
        };
        let task = tokio::spawn(monitor.run());

        Ok(ListenHandle {
            state: state_rx,
            task,
        })
    }
}

fn transition(state: &watch::Sender<ListenState>, next: ListenState) {
    let prev = state.send_replace(next);
    debug!(from = ?prev, to = ?next, "Listen state changed");
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// The handler receivers call for every event they pull.
struct DispatchBridge {
    dispatcher: Arc<MapEventDispatcher>,
}

#[async_trait]
impl EventHandler for DispatchBridge {
    async fn handle(&self, event: &VersionedEvent) -> Result<()> {
        let result = self.dispatcher.dispatch_event(event).await;
        if let Err(e) = &result {
            debug!(
                id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Error dispatching event"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct Monitor {
    stop: oneshot::Receiver<()>,
    close: mpsc::Sender<CloseRequest>,
    errors: mpsc::Receiver<anyhow::Error>,
    errors_open: bool,
    state: watch::Sender<ListenState>,
}

impl Monitor {
    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = &mut self.stop => break,
                report = self.errors.recv(), if self.errors_open => self.on_error_report(report),
            }
        }

        info!("EventDispatchManager stopping");
        transition(&self.state, ListenState::Stopping);
        let outcome = self.close_handshake().await;
        transition(&self.state, ListenState::Stopped);
        info!(clean = outcome.is_ok(), "EventDispatchManager stopped");
        outcome
    }

    fn on_error_report(&mut self, report: Option<anyhow::Error>) {
        match report {
            Some(e) => warn!(error = %e, "Receiver reported an error"),
            None => {
                debug!("Receiver closed its error channel");
                self.errors_open = false;
            }
        }
    }

    /// Send one close request and wait for the receiver's answer. Error
    /// reports keep draining meanwhile so a receiver blocked on reporting can
    /// still reach its acknowledgement.
    async fn close_handshake(&mut self) -> Result<()> {
        let (request, mut reply) = CloseRequest::new();
        if self.close.send(request).await.is_err() {
            warn!("Receiver dropped its close channel before the close request");
            return Err(ListenError::ReceiverGone.into());
        }
        debug!("Close request sent, awaiting receiver");

        let answer = loop {
            tokio::select! {
                answer = &mut reply => break answer,
                report = self.errors.recv(), if self.errors_open => self.on_error_report(report),
            }
        };

        match answer {
            Ok(Ok(())) => {
                debug!("Receiver acknowledged close");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Receiver closed with an error");
                Err(e)
            }
            Err(_) => {
                warn!("Receiver dropped the close request without answering");
                Err(ListenError::HandshakeAbandoned.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ListenHandle
// ---------------------------------------------------------------------------

/// Observes one listen session.
#[derive(Debug)]
pub struct ListenHandle {
    state: watch::Receiver<ListenState>,
    task: JoinHandle<Result<()>>,
}

impl ListenHandle {
    pub fn state(&self) -> ListenState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ListenState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to stop. Returns the receiver's answer to the
    /// close request.
    pub async fn stopped(self) -> Result<()> {
        self.task.await.map_err(ListenError::Monitor)?
    }
}
