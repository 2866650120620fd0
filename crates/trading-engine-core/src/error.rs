// File: src/error.rs
//
// Error taxonomy for the event-sourcing core

use uuid::Uuid;

/// Result type for event sourcing operations
pub type EventResult<T> = Result<T, EventError>;

/// Error types for event sourcing operations
#[derive(Debug, thiserror::Error, Clone)]
pub enum EventError {
    /// Optimistic-concurrency failure on append. Recoverable by
    /// reload-and-retry at the caller.
    #[error("Concurrency conflict for {aggregate_kind}/{aggregate_id}: expected version {expected}, store at {actual}")]
    ConcurrencyConflict {
        aggregate_kind: String,
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Aggregate not found: {aggregate_kind}/{aggregate_id}")]
    AggregateNotFound {
        aggregate_kind: String,
        aggregate_id: String,
    },

    #[error("Unknown aggregate kind: {kind}")]
    UnknownAggregateKind { kind: String },

    #[error("Unknown command kind: {kind}")]
    UnknownCommandKind { kind: String },

    #[error("Unknown query kind: {kind}")]
    UnknownQueryKind { kind: String },

    #[error("Already registered: {name}")]
    AlreadyRegistered { name: String },

    /// Malformed append batch: empty, spans multiple aggregates, or
    /// non-dense versions. Indicates a programmer error.
    #[error("Invalid batch: {message}")]
    InvalidBatch { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Deserialization error: {message}")]
    DeserializationError { message: String },

    /// Publish to a remote adapter failed. The event is already durably
    /// persisted when this surfaces; the circuit breaker consumes it.
    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// An apply step failed during load; the aggregate is left in a
    /// partial state.
    #[error("Replay error for {aggregate_kind}/{aggregate_id} at version {version}: {message}")]
    ReplayError {
        aggregate_kind: String,
        aggregate_id: String,
        version: i64,
        message: String,
    },

    #[error("Snapshot error: {message}")]
    SnapshotError { message: String },

    /// Advisory only. Counted and logged by the ordering validator,
    /// never surfaced from publish.
    #[error("Ordering violation: {message}")]
    OrderingViolation { message: String },

    #[error("Event not found: {event_id}")]
    EventNotFound { event_id: Uuid },

    /// Backing storage failure (I/O, lock poisoning, pool exhaustion).
    #[error("Store error: {message}")]
    StoreError { message: String },

    /// Domain error raised by a command handler, surfaced verbatim.
    #[error("{message}")]
    Domain { message: String },

    #[error("Handler error: {message}")]
    HandlerError { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Shutting down: {message}")]
    ShuttingDown { message: String },
}

impl EventError {
    /// Whether the caller can recover with a reload-and-retry cycle.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EventError::ConcurrencyConflict { .. })
    }

    pub fn domain(message: impl Into<String>) -> Self {
        EventError::Domain {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EventError {
    fn from(error: serde_json::Error) -> Self {
        EventError::SerializationError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_is_retriable() {
        let err = EventError::ConcurrencyConflict {
            aggregate_kind: "account".to_string(),
            aggregate_id: "A1".to_string(),
            expected: 2,
            actual: 3,
        };
        assert!(err.is_retriable());
        assert!(!EventError::CircuitOpen.is_retriable());
    }

    #[test]
    fn domain_errors_surface_verbatim() {
        let err = EventError::domain("insufficient funds");
        assert_eq!(err.to_string(), "insufficient funds");
    }
}
