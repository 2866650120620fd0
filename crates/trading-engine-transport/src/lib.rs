// File: src/lib.rs
//
// Transport adapters and bus decorators for the trading engine:
// - Binary wire codec and subject scheme
// - In-process channel, NATS, and JetStream adapters
// - Router, sharder, ordering validator, circuit breaker, tracer
// - Config-driven runtime assembly

pub mod breaker;
pub mod codec;
pub mod memory;
pub mod nats;
pub mod ordering;
pub mod router;
pub mod runtime;
pub mod shard;
pub mod stream;
pub mod subject;
pub mod tracer;

pub use breaker::{CircuitBreakerBus, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use codec::{decode_event, encode_event, WIRE_VERSION};
pub use memory::InMemoryTransport;
pub use nats::{NatsConfig, NatsEventBus};
pub use ordering::OrderingValidator;
pub use router::{RoutingEventBus, RoutingStrategy};
pub use runtime::{in_memory_transport, CqrsRuntime, RuntimeBuilder};
pub use shard::{shard_for, ShardKeyFn, ShardStrategyRegistry, ShardedEventBus};
pub use stream::{JetStreamEventBus, StreamConfig};
pub use subject::SubjectScheme;
pub use tracer::TracingEventBus;
