// File: src/store/mod.rs
//
// Event store contract: append-only persistence with per-aggregate
// optimistic concurrency, plus the separate snapshot capability

pub mod batching;
pub mod caching;
pub mod memory;

pub use batching::{BatchingConfig, BatchingEventStore};
pub use caching::{CacheStatistics, CachedEventStore};
pub use memory::InMemoryEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EventError, EventResult};
use crate::event::{AggregateRef, EventEnvelope};

/// Event store interface for persisting and retrieving events.
///
/// Append is linearizable per aggregate. Cross-aggregate order is the
/// commit order the store chose. Reads see every event appended before
/// the read began.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append a non-empty batch belonging to a single
    /// aggregate, with dense versions `expected + 1 ..= expected + n`.
    ///
    /// Fails `ConcurrencyConflict` when the store's latest version for
    /// the aggregate differs from the batch's implied expected version,
    /// `InvalidBatch` when the batch itself is malformed. Partial
    /// batches are never visible.
    async fn append(&self, events: Vec<EventEnvelope>) -> EventResult<()>;

    /// All events for one aggregate with version strictly greater than
    /// `from_version`, in version order.
    async fn events_for(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>>;

    /// Events of one kind with timestamp `>= from`, in commit order.
    /// `limit == 0` means unbounded.
    async fn events_by_kind(
        &self,
        event_kind: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> EventResult<Vec<EventEnvelope>>;

    /// `events_for` over a set of aggregates of one kind.
    async fn events_for_aggregates(
        &self,
        aggregate_kind: &str,
        aggregate_ids: &[String],
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>>;

    /// Commit-ordered global scan from `from`. `limit == 0` means
    /// unbounded.
    async fn all_events(&self, from: DateTime<Utc>, limit: usize) -> EventResult<Vec<EventEnvelope>>;

    /// Latest persisted version for an aggregate, 0 when none exist.
    async fn latest_version(&self, aggregate_kind: &str, aggregate_id: &str) -> EventResult<i64>;

    /// Flush buffered writes and release resources.
    async fn close(&self) -> EventResult<()> {
        Ok(())
    }
}

/// Snapshot capability, composed separately at the repository boundary.
/// A store without it still works; loads fall back to full replay.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> EventResult<()>;

    /// Most recent snapshot for an aggregate, or `Ok(None)`.
    async fn latest_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> EventResult<Option<Snapshot>>;

    /// Retention: keep the `keep_latest` most recent snapshots for the
    /// aggregate, and drop any snapshot created before `older_than`.
    /// Returns the number deleted.
    async fn prune_snapshots(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        keep_latest: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> EventResult<usize>;
}

/// Captured aggregate state at a particular version. Applying the
/// events with versions `> version` on top of `blob` reproduces the
/// aggregate at its latest version.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_kind: String,
    pub version: i64,
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub event_count: i64,
    pub compressed: bool,
}

impl Snapshot {
    pub fn new(
        aggregate_kind: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: i64,
        blob: Vec<u8>,
    ) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_kind: aggregate_kind.into(),
            version,
            blob,
            created_at: Utc::now(),
            event_count: version,
            compressed: false,
        }
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef::new(self.aggregate_kind.clone(), self.aggregate_id.clone())
    }
}

/// Validate an append batch: non-empty, single aggregate, dense
/// versions. Returns the aggregate reference and the implied expected
/// version (first version minus one).
pub fn validate_batch(events: &[EventEnvelope]) -> EventResult<(AggregateRef, i64)> {
    let first = events.first().ok_or_else(|| EventError::InvalidBatch {
        message: "empty batch".to_string(),
    })?;
    let aggregate = first.aggregate_ref();
    if first.version < 1 {
        return Err(EventError::InvalidBatch {
            message: format!("first version {} < 1", first.version),
        });
    }
    for (offset, event) in events.iter().enumerate() {
        if event.aggregate_ref() != aggregate {
            return Err(EventError::InvalidBatch {
                message: format!(
                    "batch spans aggregates {} and {}",
                    aggregate,
                    event.aggregate_ref()
                ),
            });
        }
        let expected = first.version + offset as i64;
        if event.version != expected {
            return Err(EventError::InvalidBatch {
                message: format!(
                    "non-dense versions for {}: expected {}, got {}",
                    aggregate, expected, event.version
                ),
            });
        }
    }
    Ok((aggregate, first.version - 1))
}
