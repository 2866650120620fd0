// File: src/config.rs
//
// Recognized configuration surface for the CQRS core. Loading the
// values (files, environment) is the host's concern; the core only
// defines the shape and the defaults. Durations are milliseconds.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the core and its transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub event_store: EventStoreSettings,
    pub snapshot: SnapshotSettings,
    pub bus: BusSettings,
    pub transport: TransportSettings,
    pub sharding: ShardingSettings,
    pub ordering: OrderingSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub tracing: TracingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreSettings {
    /// Append-buffer flush size; 0 disables the batching decorator.
    pub batch_size: usize,
    /// Append-buffer flush interval in milliseconds.
    pub flush_interval: u64,
    /// Read-cache entry cap; 0 disables the caching decorator.
    pub cache_size: usize,
    /// Read-cache TTL in milliseconds.
    pub cache_ttl: u64,
}

impl Default for EventStoreSettings {
    fn default() -> Self {
        Self {
            batch_size: 0,
            flush_interval: 50,
            cache_size: 0,
            cache_ttl: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    /// Snapshot on every version that is a multiple of this; 0 disables.
    pub frequency: i64,
    /// Snapshot once this many events accumulate since the last one;
    /// 0 disables.
    pub event_threshold: i64,
    /// Wall-clock capture interval in milliseconds; 0 disables.
    pub time_frequency: u64,
    /// Snapshot retention window in milliseconds.
    pub retention: u64,
    pub max_per_aggregate: usize,
    pub compression_enabled: bool,
    pub max_concurrent: usize,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            frequency: 100,
            event_threshold: 100,
            time_frequency: 3_600_000,
            retention: 90 * 24 * 3_600_000,
            max_per_aggregate: 5,
            compression_enabled: true,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// 0 selects the synchronous in-process bus (the default delivery
    /// mode); anything else sizes the worker pool.
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    InMemory,
    Broker,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// Broker endpoints, e.g. `nats://localhost:4222`.
    pub endpoints: Vec<String>,
    pub topic_prefix: String,
    pub use_persistent_stream: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::InMemory,
            endpoints: vec!["nats://localhost:4222".to_string()],
            topic_prefix: "events".to_string(),
            use_persistent_stream: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategyKind {
    Aggregate,
    Kind,
    Custom,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingSettings {
    pub strategy: ShardingStrategyKind,
    pub shard_count: u32,
    /// Accepted for config compatibility; strategies are compile-time
    /// registered and this path is ignored with a warning.
    pub plugin_dir: Option<String>,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategyKind::None,
            shard_count: 1,
            plugin_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingGuarantee {
    None,
    Aggregate,
    Kind,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingSettings {
    pub guarantee: OrderingGuarantee,
}

impl Default for OrderingSettings {
    fn default() -> Self {
        Self {
            guarantee: OrderingGuarantee::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the breaker opens; 0 never opens.
    pub failure_threshold: u32,
    /// Open-to-half-open delay in milliseconds.
    pub reset_timeout: u64,
    /// Successful probes required to close from half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: 30_000,
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingSettings {
    pub enabled: bool,
    /// Trace one publish in N; 1 traces everything.
    pub sampling_rate: u64,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sampling_rate: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.transport.kind, TransportKind::InMemory);
        assert_eq!(config.ordering.guarantee, OrderingGuarantee::None);
        assert_eq!(config.bus.workers, 0);
    }

    #[test]
    fn recognized_keys_parse() {
        let config: CoreConfig = serde_json::from_value(serde_json::json!({
            "event_store": {"batch_size": 200, "flush_interval": 25},
            "snapshot": {"frequency": 3, "compression_enabled": false},
            "bus": {"workers": 8, "queue_capacity": 512},
            "transport": {"type": "stream", "topic_prefix": "md", "use_persistent_stream": true},
            "sharding": {"strategy": "aggregate", "shard_count": 16},
            "ordering": {"guarantee": "aggregate"},
            "circuit_breaker": {"failure_threshold": 3, "reset_timeout": 100},
            "tracing": {"enabled": true, "sampling_rate": 10}
        }))
        .unwrap();

        assert_eq!(config.event_store.batch_size, 200);
        assert_eq!(config.snapshot.frequency, 3);
        assert_eq!(config.transport.kind, TransportKind::Stream);
        assert_eq!(config.sharding.strategy, ShardingStrategyKind::Aggregate);
        assert_eq!(config.ordering.guarantee, OrderingGuarantee::Aggregate);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.tracing.sampling_rate, 10);
    }
}
