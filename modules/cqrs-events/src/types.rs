//! Core types for versioned events. Transport- and storage-agnostic.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Payload discriminants
// ---------------------------------------------------------------------------

/// A concrete payload type with a stable, explicitly chosen discriminant.
///
/// The discriminant is what handlers are registered under and what the type
/// registry records, so it must stay stable across processes and releases.
pub trait EventKind: Any + Send + Sync + fmt::Debug {
    /// Stable event-type name, e.g. `"account:opened"`.
    const EVENT_TYPE: &'static str;
}

/// What a type registry records for a payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadShape {
    pub name: &'static str,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl PayloadShape {
    pub fn of<T: EventKind>() -> Self {
        Self {
            name: T::EVENT_TYPE,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opaque, discriminant-tagged event payload. Cheap to clone.
#[derive(Clone)]
pub struct Payload {
    kind: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    pub fn new<T: EventKind>(value: T) -> Self {
        Self {
            kind: T::EVENT_TYPE,
            value: Arc::new(value),
        }
    }

    /// A payload with no value and an empty discriminant.
    ///
    /// This is what a deserialized envelope carries until the receiver
    /// attaches the decoded payload.
    pub fn empty() -> Self {
        Self {
            kind: "",
            value: Arc::new(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("kind", &self.kind).finish()
    }
}

// ---------------------------------------------------------------------------
// VersionedEvent
// ---------------------------------------------------------------------------

/// An event in the past for an aggregate.
///
/// The serialized field names are a contract shared with stores and
/// transports. The payload is not serialized here; collaborators own its
/// encoding and attach it back with [`VersionedEvent::with_payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedEvent {
    pub id: String,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    #[serde(rename = "sourceID")]
    pub source_id: String,
    pub actor: String,
    #[serde(rename = "onbehalfof")]
    pub on_behalf_of: String,
    /// Monotonic per source. Used by persistence for optimistic concurrency.
    pub version: i64,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "time")]
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub payload: Payload,
}

impl VersionedEvent {
    /// Create an event for `source_id` at `version`.
    /// The id is fresh, the correlation id defaults to the id, and
    /// `event_type` is taken from the payload's discriminant.
    pub fn new<T: EventKind>(source_id: impl Into<String>, version: i64, payload: T) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            source_id: source_id.into(),
            actor: String::new(),
            on_behalf_of: String::new(),
            version,
            event_type: T::EVENT_TYPE.to_string(),
            created: Utc::now(),
            payload: Payload::new(payload),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_on_behalf_of(mut self, on_behalf_of: impl Into<String>) -> Self {
        self.on_behalf_of = on_behalf_of.into();
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// Attach a decoded payload. Also rewrites `event_type` so the two never
    /// disagree.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.event_type = payload.kind().to_string();
        self.payload = payload;
        self
    }

    /// Discriminant used for handler lookup.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn payload_as<T: EventKind>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Orders events by creation time, oldest first.
pub fn by_created(a: &VersionedEvent, b: &VersionedEvent) -> Ordering {
    a.created.cmp(&b.created)
}

/// Sort for replay. Stable: events created at the same instant keep their
/// input order.
pub fn sort_by_created(events: &mut [VersionedEvent]) {
    events.sort_by(by_created);
}
