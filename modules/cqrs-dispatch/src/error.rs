use thiserror::Error;

/// Errors raised while wiring handlers into a dispatch manager.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("cannot register handler for {event_type}: dispatch table is held by an active receiver")]
    RegistrationClosed { event_type: String },

    #[error("cannot register global handler: dispatch table is held by an active receiver")]
    GlobalRegistrationClosed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type {name} is already registered to {existing}, cannot register {requested}")]
    Conflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
}

/// Failures of the close handshake, as seen by the requester.
#[derive(Error, Debug)]
pub enum ListenError {
    #[error("receiver stopped accepting close requests")]
    ReceiverGone,

    #[error("receiver dropped the close request without answering")]
    HandshakeAbandoned,

    #[error("monitor task failed: {0}")]
    Monitor(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("an exclusive receiver is already attached to the bus")]
    ReceiverBusy,

    #[error("event bus is closed")]
    Closed,
}
