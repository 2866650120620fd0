// File: src/aggregate.rs
//
// Aggregate root pattern: deterministic event application over an
// embedded base that owns the version counter and uncommitted buffer

use serde::{Deserialize, Serialize};

use crate::error::{EventError, EventResult};
use crate::event::{decode_domain_event, DomainEvent, EventEnvelope, EventMetadata};

/// Version number for aggregate concurrency control
pub type AggregateVersion = i64;

/// Base aggregate state embedded by every aggregate root. Owns the
/// identity, the current version, and the ordered buffer of uncommitted
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateBase {
    pub id: String,
    pub version: AggregateVersion,
    #[serde(skip)]
    pub uncommitted: Vec<EventEnvelope>,
}

impl AggregateBase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            uncommitted: Vec::new(),
        }
    }
}

/// Trait for aggregate roots reconstructed from events.
///
/// Implementations embed an [`AggregateBase`] and expose it through
/// `base`/`base_mut`; identity, versioning, and the uncommitted buffer
/// are handled here. `apply` must be deterministic: replaying the same
/// event sequence from the initial state always yields the same state.
pub trait AggregateRoot: Send + Sync + Sized {
    type Event: DomainEvent;

    /// Aggregate kind tag, unique across the system.
    const KIND: &'static str;

    /// Zero-value factory for the given identity.
    fn new(id: impl Into<String>) -> Self;

    fn base(&self) -> &AggregateBase;

    fn base_mut(&mut self) -> &mut AggregateBase;

    /// Mutate state from an event. Must not touch the version counter;
    /// the caller owns it.
    fn apply(&mut self, event: &Self::Event) -> EventResult<()>;

    /// Serialize the full state for a snapshot.
    fn snapshot_state(&self) -> EventResult<serde_json::Value>;

    /// Rehydrate state from a snapshot produced by `snapshot_state`.
    fn restore_state(&mut self, state: &serde_json::Value) -> EventResult<()>;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn version(&self) -> AggregateVersion {
        self.base().version
    }

    fn set_version(&mut self, version: AggregateVersion) {
        self.base_mut().version = version;
    }

    fn uncommitted(&self) -> &[EventEnvelope] {
        &self.base().uncommitted
    }

    /// Drain the uncommitted buffer, leaving the version untouched.
    fn take_uncommitted(&mut self) -> Vec<EventEnvelope> {
        std::mem::take(&mut self.base_mut().uncommitted)
    }

    /// Apply a new event and buffer it at version `version + 1`.
    fn record(&mut self, event: Self::Event) -> EventResult<()> {
        self.record_with_metadata(event, EventMetadata::default())
    }

    fn record_with_metadata(&mut self, event: Self::Event, metadata: EventMetadata) -> EventResult<()> {
        self.apply(&event)?;
        let next_version = self.base().version + 1;
        let envelope = EventEnvelope::new(
            Self::KIND,
            self.base().id.clone(),
            event.kind(),
            next_version,
            event.payload()?,
        )
        .with_metadata(metadata);
        let base = self.base_mut();
        base.version = next_version;
        base.uncommitted.push(envelope);
        Ok(())
    }

    /// Apply a persisted event without buffering, advancing the version
    /// to the envelope's.
    fn replay(&mut self, envelope: &EventEnvelope) -> EventResult<()> {
        let event = decode_domain_event::<Self::Event>(envelope)?;
        self.apply(&event).map_err(|e| EventError::ReplayError {
            aggregate_kind: Self::KIND.to_string(),
            aggregate_id: self.base().id.clone(),
            version: envelope.version,
            message: e.to_string(),
        })?;
        self.base_mut().version = envelope.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Incremented { by: i64 },
    }

    impl DomainEvent for CounterEvent {
        fn kind(&self) -> &'static str {
            match self {
                CounterEvent::Incremented { .. } => "incremented",
            }
        }

        fn payload(&self) -> EventResult<serde_json::Value> {
            Ok(serde_json::to_value(self)?)
        }

        fn from_payload(kind: &str, payload: &serde_json::Value) -> EventResult<Self> {
            match kind {
                "incremented" => Ok(serde_json::from_value(payload.clone())?),
                other => Err(EventError::DeserializationError {
                    message: format!("unknown counter event kind: {}", other),
                }),
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Counter {
        base: AggregateBase,
        total: i64,
    }

    impl AggregateRoot for Counter {
        type Event = CounterEvent;
        const KIND: &'static str = "counter";

        fn new(id: impl Into<String>) -> Self {
            Self {
                base: AggregateBase::new(id),
                total: 0,
            }
        }

        fn base(&self) -> &AggregateBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut AggregateBase {
            &mut self.base
        }

        fn apply(&mut self, event: &Self::Event) -> EventResult<()> {
            match event {
                CounterEvent::Incremented { by } => self.total += by,
            }
            Ok(())
        }

        fn snapshot_state(&self) -> EventResult<serde_json::Value> {
            Ok(json!({"total": self.total}))
        }

        fn restore_state(&mut self, state: &serde_json::Value) -> EventResult<()> {
            self.total = state["total"].as_i64().unwrap_or(0);
            Ok(())
        }
    }

    #[test]
    fn record_buffers_consecutive_versions() {
        let mut counter = Counter::new("c1");
        counter.record(CounterEvent::Incremented { by: 2 }).unwrap();
        counter.record(CounterEvent::Incremented { by: 3 }).unwrap();

        assert_eq!(counter.version(), 2);
        assert_eq!(counter.total, 5);
        let versions: Vec<i64> = counter.uncommitted().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn take_uncommitted_drains_buffer_but_keeps_version() {
        let mut counter = Counter::new("c1");
        counter.record(CounterEvent::Incremented { by: 1 }).unwrap();
        let drained = counter.take_uncommitted();

        assert_eq!(drained.len(), 1);
        assert!(counter.uncommitted().is_empty());
        assert_eq!(counter.version(), 1);
    }

    #[test]
    fn replay_applies_without_buffering() {
        let mut source = Counter::new("c1");
        source.record(CounterEvent::Incremented { by: 7 }).unwrap();
        let envelope = source.uncommitted()[0].clone();

        let mut replayed = Counter::new("c1");
        replayed.replay(&envelope).unwrap();

        assert_eq!(replayed.total, 7);
        assert_eq!(replayed.version(), 1);
        assert!(replayed.uncommitted().is_empty());
    }
}
