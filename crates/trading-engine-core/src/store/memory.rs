// File: src/store/memory.rs
//
// Reference in-memory event store: a commit-ordered log, a latest
// version map, and a nested snapshot map behind a single RwLock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::{EventError, EventResult};
use crate::event::{AggregateRef, EventEnvelope};

use super::{validate_batch, EventStore, Snapshot, SnapshotStore};

#[derive(Default)]
struct MemoryInner {
    /// Commit order is the log order.
    log: Vec<EventEnvelope>,
    versions: HashMap<AggregateRef, i64>,
    /// Keyed by aggregate, then by version: the BTreeMap keeps
    /// snapshots ordered so "latest" and retention pruning are cheap.
    snapshots: HashMap<AggregateRef, BTreeMap<i64, Snapshot>>,
}

/// In-memory reference implementation of [`EventStore`] and
/// [`SnapshotStore`]. Mutations take the write lock, queries the read
/// lock; nothing awaits while a lock is held.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: RwLock<MemoryInner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of persisted events, across all aggregates.
    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.log.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        let (aggregate, expected) = validate_batch(&events)?;
        let mut inner = self.inner.write().await;
        let current = inner.versions.get(&aggregate).copied().unwrap_or(0);
        if current != expected {
            return Err(EventError::ConcurrencyConflict {
                aggregate_kind: aggregate.kind,
                aggregate_id: aggregate.id,
                expected,
                actual: current,
            });
        }
        let last_version = events[events.len() - 1].version;
        inner.log.extend(events);
        inner.versions.insert(aggregate, last_version);
        Ok(())
    }

    async fn events_for(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let mut events: Vec<EventEnvelope> = inner
            .log
            .iter()
            .filter(|e| {
                e.aggregate_kind == aggregate_kind
                    && e.aggregate_id == aggregate_id
                    && e.version > from_version
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn events_by_kind(
        &self,
        event_kind: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> EventResult<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let iter = inner
            .log
            .iter()
            .filter(|e| e.event_kind == event_kind && e.occurred_at >= from)
            .cloned();
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    async fn events_for_aggregates(
        &self,
        aggregate_kind: &str,
        aggregate_ids: &[String],
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let mut events: Vec<EventEnvelope> = inner
            .log
            .iter()
            .filter(|e| {
                e.aggregate_kind == aggregate_kind
                    && e.version > from_version
                    && aggregate_ids.contains(&e.aggregate_id)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| (&a.aggregate_id, a.version).cmp(&(&b.aggregate_id, b.version)));
        Ok(events)
    }

    async fn all_events(&self, from: DateTime<Utc>, limit: usize) -> EventResult<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let iter = inner.log.iter().filter(|e| e.occurred_at >= from).cloned();
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    async fn latest_version(&self, aggregate_kind: &str, aggregate_id: &str) -> EventResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .get(&AggregateRef::new(aggregate_kind, aggregate_id))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> EventResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .entry(snapshot.aggregate_ref())
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> EventResult<Option<Snapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .snapshots
            .get(&AggregateRef::new(aggregate_kind, aggregate_id))
            .and_then(|by_version| by_version.values().next_back().cloned()))
    }

    async fn prune_snapshots(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        keep_latest: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> EventResult<usize> {
        let mut inner = self.inner.write().await;
        let aggregate = AggregateRef::new(aggregate_kind, aggregate_id);
        let Some(by_version) = inner.snapshots.get_mut(&aggregate) else {
            return Ok(0);
        };
        let before = by_version.len();
        if by_version.len() > keep_latest {
            let cutoff: Vec<i64> = by_version
                .keys()
                .rev()
                .skip(keep_latest)
                .copied()
                .collect();
            for version in cutoff {
                by_version.remove(&version);
            }
        }
        if let Some(older_than) = older_than {
            by_version.retain(|_, snapshot| snapshot.created_at >= older_than);
        }
        Ok(before - by_version.len())
    }
}
