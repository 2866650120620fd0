// File: src/runtime.rs
//
// Config-driven assembly of the CQRS stack: store decorators, delivery
// bus, transport adapter, and the decorator chain, wired in one place.
// Layering, outermost first:
//   EventSourcedBus -> tracer -> breaker -> ordering -> sharder -> adapter

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use trading_engine_core::bus::{
    EventBus, EventSourcedBus, SyncEventBus, WorkerPoolConfig, WorkerPoolEventBus,
};
use trading_engine_core::command::{CommandBus, EventSourcedCommandBus};
use trading_engine_core::config::{CoreConfig, TransportKind};
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::projection::ProjectionManager;
use trading_engine_core::query::QueryBus;
use trading_engine_core::repository::AggregateRepository;
use trading_engine_core::snapshot::{SnapshotConfig, SnapshotManager};
use trading_engine_core::store::{
    BatchingConfig, BatchingEventStore, CachedEventStore, EventStore, InMemoryEventStore,
    SnapshotStore,
};

use crate::breaker::{CircuitBreakerBus, CircuitBreakerConfig};
use crate::memory::InMemoryTransport;
use crate::nats::{NatsConfig, NatsEventBus};
use crate::ordering::OrderingValidator;
use crate::shard::{ShardStrategyRegistry, ShardedEventBus};
use crate::stream::{JetStreamEventBus, StreamConfig};
use crate::subject::SubjectScheme;
use crate::tracer::TracingEventBus;

/// The assembled spine: everything a host needs to dispatch commands,
/// serve queries, and observe events.
pub struct CqrsRuntime {
    pub store: Arc<dyn EventStore>,
    pub bus: Arc<EventSourcedBus>,
    pub repository: Arc<AggregateRepository>,
    pub command_bus: Arc<CommandBus>,
    pub event_command_bus: Arc<EventSourcedCommandBus>,
    pub query_bus: Arc<QueryBus>,
    pub projections: Arc<ProjectionManager>,
    pub snapshots: Option<Arc<SnapshotManager>>,
}

impl std::fmt::Debug for CqrsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqrsRuntime")
            .field("has_snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder over [`CoreConfig`]. Custom shard strategies are registered
/// here, at program start, before `build` runs.
pub struct RuntimeBuilder {
    config: CoreConfig,
    registry: ShardStrategyRegistry,
    custom_strategy: Option<String>,
    nats_client: Option<async_nats::Client>,
}

impl RuntimeBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            registry: ShardStrategyRegistry::new(),
            custom_strategy: None,
            nats_client: None,
        }
    }

    /// Register a custom shard strategy and select it by name.
    pub fn with_custom_shard_strategy(
        mut self,
        name: impl Into<String>,
        key_fn: crate::shard::ShardKeyFn,
    ) -> EventResult<Self> {
        let name = name.into();
        self.registry.register(name.clone(), key_fn)?;
        self.custom_strategy = Some(name);
        Ok(self)
    }

    /// Reuse an existing NATS client instead of connecting.
    pub fn with_nats_client(mut self, client: async_nats::Client) -> Self {
        self.nats_client = Some(client);
        self
    }

    /// Assemble over the in-memory reference store.
    pub async fn build(self) -> EventResult<CqrsRuntime> {
        let base = Arc::new(InMemoryEventStore::new());
        self.build_with(base.clone(), Some(base)).await
    }

    /// Assemble over a caller-provided store (and optional snapshot
    /// capability, composed separately).
    pub async fn build_with(
        self,
        base_store: Arc<dyn EventStore>,
        snapshot_store: Option<Arc<dyn SnapshotStore>>,
    ) -> EventResult<CqrsRuntime> {
        let config = &self.config;
        let scheme = SubjectScheme::new(config.transport.topic_prefix.as_str());

        // Store decorators: batching under caching, so cached reads
        // trigger the flush-before-read path.
        let mut store: Arc<dyn EventStore> = base_store;
        if config.event_store.batch_size > 0 {
            store = BatchingEventStore::new(
                store,
                BatchingConfig {
                    batch_size: config.event_store.batch_size,
                    flush_interval: Duration::from_millis(config.event_store.flush_interval),
                },
            );
        }
        if config.event_store.cache_size > 0 {
            store = Arc::new(CachedEventStore::new(
                store,
                config.event_store.cache_size,
                Duration::from_millis(config.event_store.cache_ttl),
            ));
        }

        // Delivery substrate per transport type.
        let adapter: Arc<dyn EventBus> = match config.transport.kind {
            TransportKind::InMemory => {
                if config.bus.workers > 0 {
                    Arc::new(WorkerPoolEventBus::new(WorkerPoolConfig {
                        workers: config.bus.workers,
                        queue_capacity: config.bus.queue_capacity,
                        ..WorkerPoolConfig::default()
                    }))
                } else {
                    Arc::new(SyncEventBus::new())
                }
            }
            TransportKind::Broker => {
                let nats_config = NatsConfig {
                    endpoints: config.transport.endpoints.clone(),
                    scheme: scheme.clone(),
                    ..NatsConfig::default()
                };
                match self.nats_client.clone() {
                    Some(client) => Arc::new(NatsEventBus::with_client(client, nats_config)),
                    None => Arc::new(NatsEventBus::connect(nats_config).await?),
                }
            }
            TransportKind::Stream => {
                if !config.transport.use_persistent_stream {
                    info!("transport.type = stream implies use_persistent_stream");
                }
                let client = match self.nats_client.clone() {
                    Some(client) => client,
                    None => async_nats::connect(config.transport.endpoints.join(","))
                        .await
                        .map_err(|e| EventError::TransportError {
                            message: format!("nats connect failed: {}", e),
                        })?,
                };
                Arc::new(
                    JetStreamEventBus::connect(
                        client,
                        StreamConfig {
                            scheme: scheme.clone(),
                            shard_count: config.sharding.shard_count.max(1),
                            ..StreamConfig::default()
                        },
                    )
                    .await?,
                )
            }
        };

        // Decorators, innermost first.
        let mut delivery: Arc<dyn EventBus> = adapter;
        if let Some(key_fn) = self
            .registry
            .resolve(&config.sharding, self.custom_strategy.as_deref())?
        {
            delivery = Arc::new(ShardedEventBus::new(
                delivery,
                config.sharding.shard_count,
                key_fn,
            ));
        }
        if config.ordering.guarantee != trading_engine_core::config::OrderingGuarantee::None {
            delivery = Arc::new(OrderingValidator::new(delivery, config.ordering.guarantee));
        }
        delivery = Arc::new(CircuitBreakerBus::new(
            delivery,
            CircuitBreakerConfig::from(&config.circuit_breaker),
        ));
        if config.tracing.enabled {
            delivery = Arc::new(TracingEventBus::new(delivery, config.tracing.sampling_rate));
        }

        let bus = Arc::new(EventSourcedBus::new(store.clone(), delivery));

        let snapshots = snapshot_store.map(|snapshot_store| {
            Arc::new(SnapshotManager::new(
                snapshot_store,
                SnapshotConfig {
                    frequency: config.snapshot.frequency,
                    event_threshold: config.snapshot.event_threshold,
                    time_frequency: if config.snapshot.time_frequency == 0 {
                        // 0 disables the wall-clock trigger.
                        Duration::MAX
                    } else {
                        Duration::from_millis(config.snapshot.time_frequency)
                    },
                    retention: Duration::from_millis(config.snapshot.retention),
                    max_per_aggregate: config.snapshot.max_per_aggregate,
                    compression_enabled: config.snapshot.compression_enabled,
                    max_concurrent: config.snapshot.max_concurrent,
                    ..SnapshotConfig::default()
                },
            ))
        });

        let mut repository = AggregateRepository::new(store.clone(), bus.clone());
        if let Some(snapshots) = &snapshots {
            repository = repository.with_snapshots(snapshots.clone());
        }

        info!(
            transport = ?config.transport.kind,
            workers = config.bus.workers,
            sharding = ?config.sharding.strategy,
            ordering = ?config.ordering.guarantee,
            tracing = config.tracing.enabled,
            "cqrs runtime assembled"
        );

        Ok(CqrsRuntime {
            store: store.clone(),
            bus: bus.clone(),
            repository: Arc::new(repository),
            command_bus: Arc::new(CommandBus::new()),
            event_command_bus: Arc::new(EventSourcedCommandBus::new(bus)),
            query_bus: Arc::new(QueryBus::new()),
            projections: Arc::new(ProjectionManager::new(store)),
            snapshots,
        })
    }
}

/// Standalone in-process channel transport for hosts that want the
/// per-topic substrate without the full runtime.
pub fn in_memory_transport(config: &CoreConfig) -> InMemoryTransport {
    InMemoryTransport::new(
        SubjectScheme::new(config.transport.topic_prefix.as_str()),
        config.bus.queue_capacity,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trading_engine_core::config::{OrderingGuarantee, ShardingStrategyKind};

    #[tokio::test]
    async fn default_config_builds_the_sync_in_memory_stack() {
        let runtime = RuntimeBuilder::new(CoreConfig::default()).build().await.unwrap();
        assert!(runtime.snapshots.is_some());

        // The assembled bus is durable: publish lands in the store.
        let event = trading_engine_core::event::EventEnvelope::new(
            "account",
            "A1",
            "funds_deposited",
            1,
            json!({}),
        );
        use trading_engine_core::bus::EventBus as _;
        runtime.bus.publish(event).await.unwrap();
        assert_eq!(
            runtime.store.latest_version("account", "A1").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn sharding_and_ordering_decorators_install_from_config() {
        let mut config = CoreConfig::default();
        config.sharding.strategy = ShardingStrategyKind::Aggregate;
        config.sharding.shard_count = 8;
        config.ordering.guarantee = OrderingGuarantee::Aggregate;
        config.tracing.enabled = true;
        config.bus.workers = 2;

        let runtime = RuntimeBuilder::new(config).build().await.unwrap();
        use trading_engine_core::bus::EventBus as _;
        runtime
            .bus
            .publish(trading_engine_core::event::EventEnvelope::new(
                "account",
                "A1",
                "funds_deposited",
                1,
                json!({}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn custom_strategy_must_be_registered() {
        let mut config = CoreConfig::default();
        config.sharding.strategy = ShardingStrategyKind::Custom;
        let err = RuntimeBuilder::new(config).build().await.unwrap_err();
        assert!(matches!(err, EventError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn batching_decorator_installs_from_config() {
        let mut config = CoreConfig::default();
        config.event_store.batch_size = 10;
        config.event_store.cache_size = 32;
        let runtime = RuntimeBuilder::new(config).build().await.unwrap();

        use trading_engine_core::bus::EventBus as _;
        runtime
            .bus
            .publish(trading_engine_core::event::EventEnvelope::new(
                "account",
                "A1",
                "funds_deposited",
                1,
                json!({}),
            ))
            .await
            .unwrap();
        // Reads flush the batch buffer first.
        let events = runtime.store.events_for("account", "A1", 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
