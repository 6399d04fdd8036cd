//! The dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use cqrs_events::VersionedEvent;
use tracing::debug;

use crate::metrics::CounterMetrics;
use crate::traits::{DispatchMetrics, EventHandler};

/// Routes events to handlers registered for their payload discriminant, then
/// to global handlers.
///
/// Handlers run sequentially in registration order. The first failure stops
/// the dispatch: later type handlers and all global handlers are skipped and
/// the failing handler's error is returned unchanged.
///
/// Registration needs `&mut self` and dispatch `&self`, so a table cannot be
/// registered into while it is being dispatched from.
pub struct MapEventDispatcher {
    registry: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    global_handlers: Vec<Arc<dyn EventHandler>>,
    metrics: Arc<dyn DispatchMetrics>,
}

impl MapEventDispatcher {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(CounterMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<dyn DispatchMetrics>) -> Self {
        Self {
            registry: HashMap::new(),
            global_handlers: Vec::new(),
            metrics,
        }
    }

    /// Append a handler for events whose payload discriminant is `event_type`.
    pub fn register_event_handler(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, "Registering event handler");
        self.registry.entry(event_type).or_default().push(handler);
    }

    /// Append a handler that runs for every event.
    pub fn register_global_handler(&mut self, handler: Arc<dyn EventHandler>) {
        debug!("Registering global handler");
        self.global_handlers.push(handler);
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.registry.get(event_type).map_or(0, Vec::len)
    }

    pub fn global_handler_count(&self) -> usize {
        self.global_handlers.len()
    }

    pub fn metrics(&self) -> &Arc<dyn DispatchMetrics> {
        &self.metrics
    }

    /// Run every handler registered for this event.
    ///
    /// An event type with no handlers is not an error; global handlers still
    /// run.
    pub async fn dispatch_event(&self, event: &VersionedEvent) -> Result<()> {
        let handlers = self
            .registry
            .get(event.kind())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for handler in handlers.iter().chain(&self.global_handlers) {
            if let Err(e) = handler.handle(event).await {
                self.metrics.event_failed(&event.event_type);
                return Err(e);
            }
        }

        self.metrics.event_dispatched(&event.event_type);
        Ok(())
    }
}

impl Default for MapEventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
