//! In-memory collaborators: type registry and event bus. No external
//! services required, used by tests and the demo binary.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cqrs_events::{PayloadShape, VersionedEvent};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{BusError, RegistryError};
use crate::traits::{
    CloseRequest, EventHandler, ReceiverOptions, TypeRegistry, VersionedEventPublisher,
    VersionedEventReceiver,
};

// ---------------------------------------------------------------------------
// MemoryTypeRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryTypeRegistry {
    types: RwLock<HashMap<&'static str, PayloadShape>>,
}

impl MemoryTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TypeRegistry for MemoryTypeRegistry {
    fn register_type(&self, shape: PayloadShape) -> Result<(), RegistryError> {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        match types.entry(shape.name) {
            Entry::Occupied(entry) if entry.get().type_id == shape.type_id => Ok(()),
            Entry::Occupied(entry) => Err(RegistryError::Conflict {
                name: shape.name.to_string(),
                existing: entry.get().type_name,
                requested: shape.type_name,
            }),
            Entry::Vacant(entry) => {
                debug!(name = shape.name, type_name = shape.type_name, "Registered event type");
                entry.insert(shape);
                Ok(())
            }
        }
    }

    fn get_type_by_name(&self, name: &str) -> Option<PayloadShape> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// MemoryEventBus
// ---------------------------------------------------------------------------

/// Tracks receivers attached to the bus.
#[derive(Debug, Default)]
struct Attachments {
    active: usize,
    exclusive: bool,
}

/// In-process event bus. Published events are queued and pulled by
/// `listener_count` pump tasks per attached receiver.
///
/// Delivery is at-most-once: an event whose handler fails is logged and
/// dropped. Attached receivers compete for events.
pub struct MemoryEventBus {
    sender: mpsc::UnboundedSender<VersionedEvent>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<VersionedEvent>>>,
    attachments: Arc<Mutex<Attachments>>,
    closed: AtomicBool,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            sender,
            queue: Arc::new(AsyncMutex::new(queue)),
            attachments: Arc::new(Mutex::new(Attachments::default())),
            closed: AtomicBool::new(false),
        }
    }

    /// Reject further publishes. Events already queued are still delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn attached_receivers(&self) -> usize {
        lock(&self.attachments).active
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(attachments: &Mutex<Attachments>) -> MutexGuard<'_, Attachments> {
    attachments.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl VersionedEventPublisher for MemoryEventBus {
    async fn publish_events(&self, events: Vec<VersionedEvent>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed.into());
        }
        debug!(count = events.len(), "Publishing events");
        for event in events {
            // The bus owns the receiving half, so the queue cannot be closed.
            self.sender.send(event).map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl VersionedEventReceiver for MemoryEventBus {
    async fn receive_events(&self, options: ReceiverOptions) -> Result<()> {
        {
            let mut attachments = lock(&self.attachments);
            if attachments.active > 0 && (attachments.exclusive || options.exclusive) {
                return Err(BusError::ReceiverBusy.into());
            }
            attachments.active += 1;
            attachments.exclusive = options.exclusive;
        }

        let (halt, halted) = watch::channel(false);
        let listeners = options.listener_count.max(1);
        let mut pool = PumpPool {
            queue: self.queue.clone(),
            handler: options.receive_event.clone(),
            halted,
            pumps: JoinSet::new(),
            spawned: 0,
        };
        for _ in 0..listeners {
            pool.spawn();
        }
        debug!(listeners, exclusive = options.exclusive, "Receiver attached to memory bus");

        tokio::spawn(supervise(
            pool,
            options.close,
            options.errors,
            halt,
            self.attachments.clone(),
        ));
        Ok(())
    }
}

/// The pump tasks of one attached receiver.
struct PumpPool {
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<VersionedEvent>>>,
    handler: Arc<dyn EventHandler>,
    halted: watch::Receiver<bool>,
    pumps: JoinSet<()>,
    spawned: usize,
}

impl PumpPool {
    fn spawn(&mut self) {
        let listener = self.spawned;
        self.spawned += 1;
        self.pumps.spawn(pump(
            listener,
            self.queue.clone(),
            self.handler.clone(),
            self.halted.clone(),
        ));
    }
}

/// Pull events off the shared queue until halted.
async fn pump(
    listener: usize,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<VersionedEvent>>>,
    handler: Arc<dyn EventHandler>,
    mut halted: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = halted.changed() => break,
            event = next_event(&queue) => match event {
                Some(event) => event,
                None => break,
            },
        };

        // In-flight events finish even if a halt arrives meanwhile.
        if let Err(e) = handler.handle(&event).await {
            warn!(listener, id = %event.id, event_type = %event.event_type, error = %e, "Handler failed, dropping event");
        }
    }
    debug!(listener, "Listener stopped");
}

async fn next_event(
    queue: &AsyncMutex<mpsc::UnboundedReceiver<VersionedEvent>>,
) -> Option<VersionedEvent> {
    queue.lock().await.recv().await
}

/// Own the close channel: report pump failures and replace the failed
/// pump until a close request arrives, then halt the pumps, wait for them
/// and acknowledge.
async fn supervise(
    mut pool: PumpPool,
    mut close: mpsc::Receiver<CloseRequest>,
    errors: mpsc::Sender<anyhow::Error>,
    halt: watch::Sender<bool>,
    attachments: Arc<Mutex<Attachments>>,
) {
    let request = loop {
        tokio::select! {
            request = close.recv() => break request,
            Some(joined) = pool.pumps.join_next() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Listener failed, starting a replacement");
                    pool.spawn();
                    let report = anyhow!("memory bus listener failed: {e}");
                    if errors.send(report).await.is_err() {
                        debug!("Error report dropped, manager is gone");
                    }
                }
            }
        }
    };

    halt.send_replace(true);
    while let Some(joined) = pool.pumps.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Listener failed during shutdown");
        }
    }

    {
        let mut attachments = lock(&attachments);
        attachments.active = attachments.active.saturating_sub(1);
        if attachments.active == 0 {
            attachments.exclusive = false;
        }
    }

    match request {
        Some(request) => {
            debug!("Memory bus receiver closed");
            request.acknowledge(Ok(()));
        }
        None => debug!("Close channel dropped, memory bus receiver detached"),
    }
}
