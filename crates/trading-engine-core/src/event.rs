// File: src/event.rs
//
// Immutable event records and the metadata carried with every event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{EventError, EventResult};

/// Canonical metadata key names. Fixed here so every producer and every
/// transport agrees on the wire representation.
pub mod metadata_keys {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const CAUSATION_ID: &str = "causation_id";
    pub const USER_ID: &str = "user_id";
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const SHARD: &str = "shard";
}

/// Metadata attached to all events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    /// Shard hint stamped by the sharder; routes the event on sharded
    /// subjects.
    pub shard: Option<u32>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn add_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Flatten into the wire's `map<string, string>` form.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = self.extra.clone();
        if let Some(id) = self.correlation_id {
            map.insert(metadata_keys::CORRELATION_ID.to_string(), id.to_string());
        }
        if let Some(id) = self.causation_id {
            map.insert(metadata_keys::CAUSATION_ID.to_string(), id.to_string());
        }
        if let Some(user) = &self.user_id {
            map.insert(metadata_keys::USER_ID.to_string(), user.clone());
        }
        if let Some(trace) = &self.trace_id {
            map.insert(metadata_keys::TRACE_ID.to_string(), trace.clone());
        }
        if let Some(span) = &self.span_id {
            map.insert(metadata_keys::SPAN_ID.to_string(), span.clone());
        }
        if let Some(shard) = self.shard {
            map.insert(metadata_keys::SHARD.to_string(), shard.to_string());
        }
        map
    }

    /// Rebuild from the wire map. Unrecognized keys land in `extra`.
    pub fn from_map(mut map: HashMap<String, String>) -> Self {
        let correlation_id = map
            .remove(metadata_keys::CORRELATION_ID)
            .and_then(|v| Uuid::parse_str(&v).ok());
        let causation_id = map
            .remove(metadata_keys::CAUSATION_ID)
            .and_then(|v| Uuid::parse_str(&v).ok());
        let user_id = map.remove(metadata_keys::USER_ID);
        let trace_id = map.remove(metadata_keys::TRACE_ID);
        let span_id = map.remove(metadata_keys::SPAN_ID);
        let shard = map
            .remove(metadata_keys::SHARD)
            .and_then(|v| v.parse::<u32>().ok());

        Self {
            correlation_id,
            causation_id,
            user_id,
            trace_id,
            span_id,
            shard,
            extra: map,
        }
    }
}

/// Reference to an aggregate: the pair that scopes versions and
/// optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub kind: String,
    pub id: String,
}

impl AggregateRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Immutable event record. Once persisted, no field mutates;
/// `(aggregate_kind, aggregate_id, version)` is unique and versions for
/// one aggregate form a dense sequence starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_kind: String,
    pub event_kind: String,
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    pub fn new(
        aggregate_kind: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_kind: impl Into<String>,
        version: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_kind: aggregate_kind.into(),
            event_kind: event_kind.into(),
            version,
            occurred_at: Utc::now(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef::new(self.aggregate_kind.clone(), self.aggregate_id.clone())
    }
}

/// Domain events are sum types with statically known kind tags. The tag
/// names the variant on the wire; dispatch back from a payload is an
/// exhaustive match inside `from_payload`.
pub trait DomainEvent: Clone + Send + Sync + Sized {
    /// Static kind tag for this event.
    fn kind(&self) -> &'static str;

    /// Serialize the variant's fields into the envelope payload.
    fn payload(&self) -> EventResult<serde_json::Value>;

    /// Rebuild the variant from a kind tag and payload.
    fn from_payload(kind: &str, payload: &serde_json::Value) -> EventResult<Self>;
}

/// Decode the domain event carried by an envelope.
pub fn decode_domain_event<E: DomainEvent>(envelope: &EventEnvelope) -> EventResult<E> {
    E::from_payload(&envelope.event_kind, &envelope.payload).map_err(|e| match e {
        EventError::DeserializationError { message } => EventError::DeserializationError {
            message: format!(
                "event {} ({}) for {}: {}",
                envelope.event_id,
                envelope.event_kind,
                envelope.aggregate_ref(),
                message
            ),
        },
        other => other,
    })
}
