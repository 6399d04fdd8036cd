//! Publication log — every integration event ever published, for read-model
//! reconstruction.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{sort_by_created, VersionedEvent};

/// Records published events so read models can be rebuilt from scratch.
#[async_trait]
pub trait VersionedEventPublicationLogger: Send + Sync {
    async fn save_integration_event(&self, event: VersionedEvent) -> Result<()>;

    /// All events, oldest first.
    async fn all_integration_events_ever_published(&self) -> Result<Vec<VersionedEvent>>;

    /// Events sharing a correlation id, oldest first.
    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>>;
}

// ---------------------------------------------------------------------------
// MemoryPublicationLog (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory publication log. Thread-safe.
#[derive(Default)]
pub struct MemoryPublicationLog {
    events: Mutex<Vec<VersionedEvent>>,
}

impl MemoryPublicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<VersionedEvent>> {
        // A poisoned log still holds every event appended before the panic.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect(&self, filter: impl Fn(&VersionedEvent) -> bool) -> Vec<VersionedEvent> {
        let mut events: Vec<VersionedEvent> =
            self.lock().iter().filter(|e| filter(e)).cloned().collect();
        sort_by_created(&mut events);
        events
    }
}

#[async_trait]
impl VersionedEventPublicationLogger for MemoryPublicationLog {
    async fn save_integration_event(&self, event: VersionedEvent) -> Result<()> {
        tracing::debug!(id = %event.id, event_type = %event.event_type, "Logged integration event");
        self.lock().push(event);
        Ok(())
    }

    async fn all_integration_events_ever_published(&self) -> Result<Vec<VersionedEvent>> {
        Ok(self.collect(|_| true))
    }

    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>> {
        Ok(self.collect(|e| e.correlation_id == correlation_id))
    }
}
