//! Versioned event dispatch.
//!
//! Receivers pull events from a transport and hand them to a bridge owned by
//! the [`EventDispatchManager`], which runs them through the
//! [`MapEventDispatcher`]: type handlers in registration order, then global
//! handlers, stopping at the first failure.
//!
//! Shutdown is a cooperative handshake. The manager sends a [`CloseRequest`]
//! to the receiver and waits for exactly one answer on it.
//!
//! Transports, type registries and metrics sinks are traits; in-memory
//! versions live in [`memory`] and [`metrics`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod traits;
pub mod transacted;

pub use config::DispatchConfig;
pub use dispatcher::MapEventDispatcher;
pub use error::{BusError, DispatchError, ListenError, RegistryError};
pub use manager::{EventDispatchManager, ListenHandle, ListenOptions, ListenState};
pub use memory::{MemoryEventBus, MemoryTypeRegistry};
pub use metrics::{CounterMetrics, MetricsSnapshot};
pub use traits::{
    handler_fn, CloseRequest, DispatchMetrics, EventBus, EventHandler, ReceiverOptions,
    TypeRegistry, VersionedEventPublisher, VersionedEventReceiver,
};
pub use transacted::{TransactedAccept, TransactedHandler};
