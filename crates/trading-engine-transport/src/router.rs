// File: src/router.rs
//
// Routes publishes across named adapters by strategy; subscriptions
// span all adapters unless the strategy pins the topic to one

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionId};
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::EventEnvelope;

/// How the router picks adapters for a publish.
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    /// Everything goes to one named adapter.
    Single(String),
    /// Event kind chooses the adapter; unmapped kinds fall back.
    ByEventKind {
        routes: HashMap<String, String>,
        fallback: String,
    },
    /// Aggregate kind chooses the adapter; unmapped kinds fall back.
    ByAggregateKind {
        routes: HashMap<String, String>,
        fallback: String,
    },
    /// Try adapters in order until one succeeds.
    Priority(Vec<String>),
    /// Send to every adapter.
    Broadcast,
}

/// Event bus over a set of named adapters (`in_memory`, `broker`,
/// `stream`, ...). Subscriptions fan out across every adapter, so a
/// subscriber sees events regardless of which substrate carried them;
/// the ids handed back unsubscribe everywhere at once.
pub struct RoutingEventBus {
    adapters: HashMap<String, Arc<dyn EventBus>>,
    strategy: RoutingStrategy,
    /// Router id -> (adapter name, adapter-local id).
    subscriptions: tokio::sync::RwLock<HashMap<SubscriptionId, Vec<(String, SubscriptionId)>>>,
}

impl std::fmt::Debug for RoutingEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEventBus")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl RoutingEventBus {
    pub fn new(
        adapters: HashMap<String, Arc<dyn EventBus>>,
        strategy: RoutingStrategy,
    ) -> EventResult<Self> {
        let check = |name: &String| -> EventResult<()> {
            if adapters.contains_key(name) {
                Ok(())
            } else {
                Err(EventError::ConfigurationError {
                    message: format!("routing strategy references unknown adapter '{}'", name),
                })
            }
        };
        match &strategy {
            RoutingStrategy::Single(name) => check(name)?,
            RoutingStrategy::ByEventKind { routes, fallback }
            | RoutingStrategy::ByAggregateKind { routes, fallback } => {
                check(fallback)?;
                for name in routes.values() {
                    check(name)?;
                }
            }
            RoutingStrategy::Priority(names) => {
                for name in names {
                    check(name)?;
                }
            }
            RoutingStrategy::Broadcast => {}
        }
        Ok(Self {
            adapters,
            strategy,
            subscriptions: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    fn adapter(&self, name: &str) -> EventResult<&Arc<dyn EventBus>> {
        self.adapters
            .get(name)
            .ok_or_else(|| EventError::ConfigurationError {
                message: format!("unknown adapter '{}'", name),
            })
    }

    async fn subscribe_all_adapters(
        &self,
        scope: SubscribeScope,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        let id = uuid::Uuid::new_v4();
        let mut local = Vec::with_capacity(self.adapters.len());
        for (name, adapter) in &self.adapters {
            let local_id = match &scope {
                SubscribeScope::All => adapter.subscribe(subscriber.clone()).await?,
                SubscribeScope::Kind(kind) => {
                    adapter.subscribe_to_kind(kind, subscriber.clone()).await?
                }
                SubscribeScope::AggregateKind(kind) => {
                    adapter
                        .subscribe_to_aggregate_kind(kind, subscriber.clone())
                        .await?
                }
            };
            local.push((name.clone(), local_id));
        }
        self.subscriptions.write().await.insert(id, local);
        Ok(id)
    }
}

enum SubscribeScope {
    All,
    Kind(String),
    AggregateKind(String),
}

#[async_trait]
impl EventBus for RoutingEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        match &self.strategy {
            RoutingStrategy::Single(name) => self.adapter(name)?.publish(event).await,
            RoutingStrategy::ByEventKind { routes, fallback } => {
                let name = routes.get(&event.event_kind).unwrap_or(fallback);
                self.adapter(name)?.publish(event).await
            }
            RoutingStrategy::ByAggregateKind { routes, fallback } => {
                let name = routes.get(&event.aggregate_kind).unwrap_or(fallback);
                self.adapter(name)?.publish(event).await
            }
            RoutingStrategy::Priority(names) => {
                let mut last_error = None;
                for name in names {
                    match self.adapter(name)?.publish(event.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(adapter = %name, error = %e, "priority route failed, trying next");
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| EventError::ConfigurationError {
                    message: "priority strategy has no adapters".to_string(),
                }))
            }
            RoutingStrategy::Broadcast => {
                let mut first_error = None;
                for (name, adapter) in &self.adapters {
                    if let Err(e) = adapter.publish(event.clone()).await {
                        warn!(adapter = %name, error = %e, "broadcast route failed");
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        self.subscribe_all_adapters(SubscribeScope::All, subscriber).await
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        // A kind pinned to one adapter by the strategy only needs that
        // adapter's subscription.
        if let RoutingStrategy::ByEventKind { routes, .. } = &self.strategy {
            if let Some(name) = routes.get(event_kind) {
                let local_id = self
                    .adapter(name)?
                    .subscribe_to_kind(event_kind, subscriber)
                    .await?;
                let id = uuid::Uuid::new_v4();
                self.subscriptions
                    .write()
                    .await
                    .insert(id, vec![(name.clone(), local_id)]);
                return Ok(id);
            }
        }
        self.subscribe_all_adapters(SubscribeScope::Kind(event_kind.to_string()), subscriber)
            .await
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.subscribe_all_adapters(
            SubscribeScope::AggregateKind(aggregate_kind.to_string()),
            subscriber,
        )
        .await
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        if let Some(local) = self.subscriptions.write().await.remove(&subscription_id) {
            for (name, local_id) in local {
                if let Some(adapter) = self.adapters.get(&name) {
                    adapter.unsubscribe(local_id).await?;
                }
            }
        }
        Ok(())
    }
}
