use thiserror::Error;

/// Errors shared with event-sourcing persistence layers.
///
/// Nothing in this workspace raises these; stores and repositories built on
/// top of it do.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("concurrency error saving event")]
    ConcurrencyConflict,

    #[error("no events pending error saving event")]
    NonePending,
}
