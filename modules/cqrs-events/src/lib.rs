//! Versioned event model.
//!
//! The envelope every collaborator (store, transport, registry) passes
//! around, a creation-time ordering for replay, and the error vocabulary
//! shared with persistence layers.
//!
//! Payloads are opaque. Each payload type picks a stable discriminant via
//! [`EventKind`]; handlers and registries key on that name, never on runtime
//! type identity.

pub mod error;
pub mod publication;
pub mod types;

pub use error::EventStoreError;
pub use publication::{MemoryPublicationLog, VersionedEventPublicationLogger};
pub use types::{by_created, sort_by_created, EventKind, Payload, PayloadShape, VersionedEvent};
