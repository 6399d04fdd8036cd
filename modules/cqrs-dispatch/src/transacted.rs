//! Transacted accepts: hand an event to another task and wait for it to
//! confirm processing before the transport forgets the message.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cqrs_events::VersionedEvent;
use tokio::sync::{mpsc, oneshot};

use crate::traits::EventHandler;

/// An event paired with its single-use acknowledgement.
#[derive(Debug)]
pub struct TransactedAccept {
    pub event: VersionedEvent,
    processed_successfully: oneshot::Sender<bool>,
}

impl TransactedAccept {
    pub fn new(event: VersionedEvent) -> (Self, oneshot::Receiver<bool>) {
        let (processed_successfully, outcome) = oneshot::channel();
        (
            Self {
                event,
                processed_successfully,
            },
            outcome,
        )
    }

    /// Report whether the event was processed. Consumes the accept.
    pub fn accept(self, ok: bool) {
        if self.processed_successfully.send(ok).is_err() {
            tracing::debug!(id = %self.event.id, "Accept outcome dropped, sender gone");
        }
    }
}

/// Handler that forwards every event as a [`TransactedAccept`] and succeeds
/// only when the consumer accepts it.
pub struct TransactedHandler {
    accepts: mpsc::Sender<TransactedAccept>,
}

impl TransactedHandler {
    pub fn new(accepts: mpsc::Sender<TransactedAccept>) -> Self {
        Self { accepts }
    }
}

#[async_trait]
impl EventHandler for TransactedHandler {
    async fn handle(&self, event: &VersionedEvent) -> Result<()> {
        let (accept, outcome) = TransactedAccept::new(event.clone());
        self.accepts
            .send(accept)
            .await
            .map_err(|_| anyhow!("accept consumer is gone"))?;

        match outcome.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow!("event {} was not processed successfully", event.id)),
            Err(_) => Err(anyhow!("event {} was dropped without an outcome", event.id)),
        }
    }
}
