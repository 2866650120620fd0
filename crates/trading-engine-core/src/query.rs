// File: src/query.rs
//
// Query bus: pure reads against projections or the store, symmetric
// with the command bus

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{EventError, EventResult};

/// A read request. Idempotent and side-effect-free by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    pub params: serde_json::Value,
}

impl Query {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> EventResult<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| EventError::DeserializationError {
            message: format!("query '{}' params: {}", self.kind, e),
        })
    }
}

/// Handler invoked by [`QueryBus::dispatch`]. Must not publish events.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle(&self, query: Query) -> EventResult<serde_json::Value>;
}

#[derive(Default)]
pub struct QueryBus {
    handlers: RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        query_kind: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> EventResult<()> {
        let kind = query_kind.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&kind) {
            return Err(EventError::AlreadyRegistered { name: kind });
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    pub async fn dispatch(&self, query: Query) -> EventResult<serde_json::Value> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&query.kind)
                .cloned()
                .ok_or_else(|| EventError::UnknownQueryKind {
                    kind: query.kind.clone(),
                })?
        };
        handler.handle(query).await
    }

    /// Dispatch and deserialize the result into a typed value.
    pub async fn dispatch_as<T: serde::de::DeserializeOwned>(&self, query: Query) -> EventResult<T> {
        let kind = query.kind.clone();
        let value = self.dispatch(query).await?;
        serde_json::from_value(value).map_err(|e| EventError::DeserializationError {
            message: format!("query '{}' result: {}", kind, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl QueryHandler for EchoHandler {
        async fn handle(&self, query: Query) -> EventResult<serde_json::Value> {
            Ok(query.params)
        }
    }

    #[tokio::test]
    async fn dispatch_returns_the_handler_result() {
        let bus = QueryBus::new();
        bus.register("echo", Arc::new(EchoHandler)).await.unwrap();

        let result = bus.dispatch(Query::new("echo", json!({"x": 1}))).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn typed_dispatch_deserializes() {
        let bus = QueryBus::new();
        bus.register("echo", Arc::new(EchoHandler)).await.unwrap();

        #[derive(Deserialize)]
        struct Out {
            x: i64,
        }
        let out: Out = bus.dispatch_as(Query::new("echo", json!({"x": 7}))).await.unwrap();
        assert_eq!(out.x, 7);
    }

    #[tokio::test]
    async fn unknown_kind_and_duplicates_are_rejected() {
        let bus = QueryBus::new();
        let err = bus.dispatch(Query::new("nope", json!({}))).await.unwrap_err();
        assert!(matches!(err, EventError::UnknownQueryKind { .. }));

        bus.register("echo", Arc::new(EchoHandler)).await.unwrap();
        let err = bus.register("echo", Arc::new(EchoHandler)).await.unwrap_err();
        assert!(matches!(err, EventError::AlreadyRegistered { .. }));
    }
}
