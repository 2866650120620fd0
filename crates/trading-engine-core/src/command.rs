// File: src/command.rs
//
// Command bus: handlers registered per command kind, dispatched under a
// read lock. Commands are not persisted; their effect is.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::{EventBus, EventSourcedBus};
use crate::error::{EventError, EventResult};
use crate::event::{EventEnvelope, EventMetadata};

/// A request to change state: intent-shaped, named by kind, carrying
/// opaque input fields and an optional target aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub kind: String,
    pub target_aggregate_id: Option<String>,
    pub fields: serde_json::Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Command {
    pub fn new(kind: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            target_aggregate_id: None,
            fields,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_target(mut self, aggregate_id: impl Into<String>) -> Self {
        self.target_aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Deserialize the fields into a typed command body.
    pub fn fields_as<T: serde::de::DeserializeOwned>(&self) -> EventResult<T> {
        serde_json::from_value(self.fields.clone()).map_err(|e| EventError::DeserializationError {
            message: format!("command '{}' fields: {}", self.kind, e),
        })
    }
}

/// Handler invoked by [`CommandBus::dispatch`]. Domain errors surface
/// verbatim to the dispatcher's caller.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> EventResult<()>;
}

/// Registers one handler per command kind. Registration takes the
/// write lock; dispatch only reads. The bus does not serialize handler
/// invocations against each other.
#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        command_kind: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> EventResult<()> {
        let kind = command_kind.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&kind) {
            return Err(EventError::AlreadyRegistered { name: kind });
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    pub async fn dispatch(&self, command: Command) -> EventResult<()> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&command.kind)
                .cloned()
                .ok_or_else(|| EventError::UnknownCommandKind {
                    kind: command.kind.clone(),
                })?
        };
        handler.handle(command).await
    }

    pub async fn registered_kinds(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}

/// Handler variant for aggregate-less command handling: returns the
/// events to persist instead of acting directly.
#[async_trait]
pub trait EventProducingHandler: Send + Sync {
    async fn handle(&self, command: Command) -> EventResult<Vec<EventEnvelope>>;
}

/// Event-sourced command bus: the handler emits events, the bus
/// persists them under the aggregate's expected version and publishes
/// them. Equivalent to the repository save path.
pub struct EventSourcedCommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn EventProducingHandler>>>,
    bus: Arc<EventSourcedBus>,
}

impl EventSourcedCommandBus {
    pub fn new(bus: Arc<EventSourcedBus>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub async fn register(
        &self,
        command_kind: impl Into<String>,
        handler: Arc<dyn EventProducingHandler>,
    ) -> EventResult<()> {
        let kind = command_kind.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&kind) {
            return Err(EventError::AlreadyRegistered { name: kind });
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    pub async fn dispatch(&self, command: Command) -> EventResult<()> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&command.kind)
                .cloned()
                .ok_or_else(|| EventError::UnknownCommandKind {
                    kind: command.kind.clone(),
                })?
        };
        let events = handler.handle(command).await?;
        self.bus.publish_batch(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SyncEventBus;
    use crate::store::{EventStore, InMemoryEventStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for CountingHandler {
        async fn handle(&self, _command: Command) -> EventResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_registered_handler() {
        let bus = CommandBus::new();
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });
        bus.register("deposit", handler.clone()).await.unwrap();

        bus.dispatch(Command::new("deposit", json!({}))).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let bus = CommandBus::new();
        let err = bus.dispatch(Command::new("nope", json!({}))).await.unwrap_err();
        assert!(matches!(err, EventError::UnknownCommandKind { .. }));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = CommandBus::new();
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });
        bus.register("deposit", handler.clone()).await.unwrap();
        let err = bus.register("deposit", handler).await.unwrap_err();
        assert!(matches!(err, EventError::AlreadyRegistered { .. }));
    }

    struct EmittingHandler;

    #[async_trait]
    impl EventProducingHandler for EmittingHandler {
        async fn handle(&self, command: Command) -> EventResult<Vec<EventEnvelope>> {
            let id = command.target_aggregate_id.unwrap_or_default();
            Ok(vec![EventEnvelope::new(
                "account",
                id,
                "account_opened",
                1,
                command.fields,
            )])
        }
    }

    #[tokio::test]
    async fn event_sourced_dispatch_persists_and_publishes() {
        let store = Arc::new(InMemoryEventStore::new());
        let sourced = Arc::new(EventSourcedBus::new(
            store.clone(),
            Arc::new(SyncEventBus::new()),
        ));
        let bus = EventSourcedCommandBus::new(sourced);
        bus.register("create_account", Arc::new(EmittingHandler)).await.unwrap();

        bus.dispatch(
            Command::new("create_account", json!({"initial_balance": 100})).with_target("A1"),
        )
        .await
        .unwrap();

        let events = store.events_for("account", "A1", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind, "account_opened");
    }
}
