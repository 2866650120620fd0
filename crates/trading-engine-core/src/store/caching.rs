// File: src/store/caching.rs
//
// Read-path cache over an event store: per-aggregate event lists with
// TTL and an entry cap, invalidated on append

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::EventResult;
use crate::event::{AggregateRef, EventEnvelope};

use super::EventStore;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStatistics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    events: Vec<EventEnvelope>,
    cached_at: Instant,
}

/// Caches full per-aggregate event lists in front of an inner store.
/// Only `events_for` is cached; kind scans and global scans pass
/// through. An append for an aggregate invalidates its entry.
pub struct CachedEventStore {
    inner: Arc<dyn EventStore>,
    cache: RwLock<HashMap<AggregateRef, CacheEntry>>,
    cache_size: usize,
    cache_ttl: Duration,
    statistics: RwLock<CacheStatistics>,
}

impl CachedEventStore {
    pub fn new(inner: Arc<dyn EventStore>, cache_size: usize, cache_ttl: Duration) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            cache_size,
            cache_ttl,
            statistics: RwLock::new(CacheStatistics::default()),
        }
    }

    pub async fn statistics(&self) -> CacheStatistics {
        self.statistics.read().await.clone()
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    async fn lookup(&self, aggregate: &AggregateRef) -> Option<Vec<EventEnvelope>> {
        let cache = self.cache.read().await;
        let entry = cache.get(aggregate)?;
        if entry.cached_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.events.clone())
    }

    async fn insert(&self, aggregate: AggregateRef, events: Vec<EventEnvelope>) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.cache_size && !cache.contains_key(&aggregate) {
            // Evict the stalest entry to stay within the cap.
            if let Some(stalest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&stalest);
                self.statistics.write().await.evictions += 1;
            }
        }
        cache.insert(aggregate, CacheEntry { events, cached_at: Instant::now() });
    }
}

#[async_trait]
impl EventStore for CachedEventStore {
    async fn append(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        let aggregate = events.first().map(EventEnvelope::aggregate_ref);
        self.inner.append(events).await?;
        if let Some(aggregate) = aggregate {
            self.cache.write().await.remove(&aggregate);
        }
        Ok(())
    }

    async fn events_for(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        let aggregate = AggregateRef::new(aggregate_kind, aggregate_id);
        if let Some(full) = self.lookup(&aggregate).await {
            self.statistics.write().await.hits += 1;
            return Ok(full.into_iter().filter(|e| e.version > from_version).collect());
        }
        self.statistics.write().await.misses += 1;
        debug!(aggregate = %aggregate, "event cache miss");
        let full = self.inner.events_for(aggregate_kind, aggregate_id, 0).await?;
        self.insert(aggregate, full.clone()).await;
        Ok(full.into_iter().filter(|e| e.version > from_version).collect())
    }

    async fn events_by_kind(
        &self,
        event_kind: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> EventResult<Vec<EventEnvelope>> {
        self.inner.events_by_kind(event_kind, from, limit).await
    }

    async fn events_for_aggregates(
        &self,
        aggregate_kind: &str,
        aggregate_ids: &[String],
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        self.inner
            .events_for_aggregates(aggregate_kind, aggregate_ids, from_version)
            .await
    }

    async fn all_events(&self, from: DateTime<Utc>, limit: usize) -> EventResult<Vec<EventEnvelope>> {
        self.inner.all_events(from, limit).await
    }

    async fn latest_version(&self, aggregate_kind: &str, aggregate_id: &str) -> EventResult<i64> {
        self.inner.latest_version(aggregate_kind, aggregate_id).await
    }

    async fn close(&self) -> EventResult<()> {
        self.inner.close().await
    }
}
