// File: src/lib.rs
//
// Event-sourced CQRS core for the trading platform. Provides:
// - Immutable event records and aggregate roots
// - Append-only event store with optimistic concurrency
// - Snapshot management with compression and retention
// - Aggregate repository (snapshot + tail replay)
// - Command, query, and event buses
// - Projections with rebuild-by-replay

pub mod account;
pub mod aggregate;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod projection;
pub mod query;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use aggregate::{AggregateBase, AggregateRoot, AggregateVersion};
pub use bus::{
    EventBus, EventSourcedBus, EventSubscriber, PartitionKey, SubscriptionFilter, SubscriptionId,
    SyncEventBus, WorkerPoolConfig, WorkerPoolEventBus,
};
pub use command::{Command, CommandBus, CommandHandler, EventProducingHandler, EventSourcedCommandBus};
pub use config::{
    BusSettings, CircuitBreakerSettings, CoreConfig, EventStoreSettings, OrderingGuarantee,
    OrderingSettings, ShardingSettings, ShardingStrategyKind, SnapshotSettings, TracingSettings,
    TransportKind, TransportSettings,
};
pub use error::{EventError, EventResult};
pub use event::{metadata_keys, AggregateRef, DomainEvent, EventEnvelope, EventMetadata};
pub use projection::{Projection, ProjectionManager, ProjectionSubscriber};
pub use query::{Query, QueryBus, QueryHandler};
pub use repository::AggregateRepository;
pub use snapshot::{SnapshotConfig, SnapshotManager, SnapshotStatistics};
pub use store::{
    BatchingConfig, BatchingEventStore, CacheStatistics, CachedEventStore, EventStore,
    InMemoryEventStore, Snapshot, SnapshotStore,
};
