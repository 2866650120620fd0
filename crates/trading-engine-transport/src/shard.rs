// File: src/shard.rs
//
// Sharding decorator: stamps a shard hint on every outbound event so
// downstream adapters route it to the shard's subject. Strategies are
// compile-time known and registered by name; custom strategies enter
// through the registry at program start, never from a plugin directory.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionId};
use trading_engine_core::config::{ShardingSettings, ShardingStrategyKind};
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::EventEnvelope;

/// Extracts the shard key from an event.
pub type ShardKeyFn = Arc<dyn Fn(&EventEnvelope) -> String + Send + Sync>;

/// Stable bucket for a key: first eight bytes of SHA-256, mod the
/// shard count. Identical across processes and restarts.
pub fn shard_for(key: &str, shard_count: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count.max(1) as u64) as u32
}

/// Named registry of shard strategies. `aggregate` and `kind` are
/// built in; customs are added by the host before the runtime is
/// assembled.
pub struct ShardStrategyRegistry {
    strategies: HashMap<String, ShardKeyFn>,
}

impl Default for ShardStrategyRegistry {
    fn default() -> Self {
        let mut strategies: HashMap<String, ShardKeyFn> = HashMap::new();
        strategies.insert(
            "aggregate".to_string(),
            Arc::new(|event: &EventEnvelope| event.aggregate_id.clone()),
        );
        strategies.insert(
            "kind".to_string(),
            Arc::new(|event: &EventEnvelope| event.event_kind.clone()),
        );
        Self { strategies }
    }
}

impl ShardStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom strategy under a name. Fails on duplicates so
    /// configuration typos do not silently shadow built-ins.
    pub fn register(&mut self, name: impl Into<String>, key_fn: ShardKeyFn) -> EventResult<()> {
        let name = name.into();
        if self.strategies.contains_key(&name) {
            return Err(EventError::AlreadyRegistered { name });
        }
        self.strategies.insert(name, key_fn);
        Ok(())
    }

    pub fn get(&self, name: &str) -> EventResult<ShardKeyFn> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| EventError::ConfigurationError {
                message: format!("unknown shard strategy '{}'", name),
            })
    }

    /// Resolve the key function for the configured strategy.
    /// `custom` looks up `custom_name`; `none` yields `None` (the
    /// sharder should not be installed at all).
    pub fn resolve(
        &self,
        settings: &ShardingSettings,
        custom_name: Option<&str>,
    ) -> EventResult<Option<ShardKeyFn>> {
        if settings.plugin_dir.is_some() {
            warn!("sharding.plugin_dir is ignored: strategies are registered at build time");
        }
        match settings.strategy {
            ShardingStrategyKind::None => Ok(None),
            ShardingStrategyKind::Aggregate => Ok(Some(self.get("aggregate")?)),
            ShardingStrategyKind::Kind => Ok(Some(self.get("kind")?)),
            ShardingStrategyKind::Custom => {
                let name = custom_name.ok_or_else(|| EventError::ConfigurationError {
                    message: "sharding.strategy = custom requires a registered strategy name"
                        .to_string(),
                })?;
                Ok(Some(self.get(name)?))
            }
        }
    }
}

/// Decorator that stamps `metadata.shard` on every outbound event and
/// forwards to the inner bus. With the aggregate-id key, all of one
/// aggregate's events land in one shard, preserving their order there.
pub struct ShardedEventBus {
    inner: Arc<dyn EventBus>,
    shard_count: u32,
    key_fn: ShardKeyFn,
}

impl ShardedEventBus {
    pub fn new(inner: Arc<dyn EventBus>, shard_count: u32, key_fn: ShardKeyFn) -> Self {
        Self {
            inner,
            shard_count: shard_count.max(1),
            key_fn,
        }
    }

    fn stamp(&self, mut event: EventEnvelope) -> EventEnvelope {
        let key = (self.key_fn)(&event);
        event.metadata.shard = Some(shard_for(&key, self.shard_count));
        event
    }
}

#[async_trait]
impl EventBus for ShardedEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        self.inner.publish(self.stamp(event)).await
    }

    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        let stamped = events.into_iter().map(|event| self.stamp(event)).collect();
        self.inner.publish_batch(stamped).await
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        self.inner.subscribe(subscriber).await
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner.subscribe_to_kind(event_kind, subscriber).await
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner.subscribe_to_aggregate_kind(aggregate_kind, subscriber).await
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        self.inner.unsubscribe(subscription_id).await
    }
}
