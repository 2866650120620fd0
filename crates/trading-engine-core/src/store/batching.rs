// File: src/store/batching.rs
//
// Append-buffering decorator: batches per-aggregate writes, flushing on
// size or interval. Reads flush first to preserve read-after-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EventError, EventResult};
use crate::event::{AggregateRef, EventEnvelope};

use super::{validate_batch, EventStore};

/// Configuration for the batching decorator.
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    /// Flush a buffer once it holds this many events.
    pub batch_size: usize,
    /// Flush all buffers at least this often.
    pub flush_interval: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(50),
        }
    }
}

/// Buffers appends per aggregate in front of an inner store.
///
/// The optimistic-concurrency check still happens at the inner store on
/// flush; a conflict therefore surfaces to whichever caller triggers the
/// flush. Every read flushes first, so readers always observe their own
/// writes. `close` flushes synchronously and stops the interval task.
pub struct BatchingEventStore {
    inner: Arc<dyn EventStore>,
    config: BatchingConfig,
    buffers: Arc<Mutex<HashMap<AggregateRef, Vec<EventEnvelope>>>>,
    shutdown: CancellationToken,
}

impl BatchingEventStore {
    pub fn new(inner: Arc<dyn EventStore>, config: BatchingConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner,
            config,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        });
        store.clone().spawn_flusher();
        store
    }

    fn spawn_flusher(self: Arc<Self>) {
        let interval = self.config.flush_interval;
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush_all().await {
                            warn!(error = %e, "interval flush failed");
                        }
                    }
                }
            }
        });
    }

    /// Flush every buffered aggregate to the inner store.
    pub async fn flush_all(&self) -> EventResult<()> {
        let drained: Vec<(AggregateRef, Vec<EventEnvelope>)> = {
            let mut buffers = self.buffers.lock().await;
            buffers.drain().collect()
        };
        let mut first_error = None;
        for (aggregate, batch) in drained {
            if batch.is_empty() {
                continue;
            }
            debug!(aggregate = %aggregate, events = batch.len(), "flushing buffered batch");
            if let Err(e) = self.inner.append(batch).await {
                warn!(aggregate = %aggregate, error = %e, "buffered append failed on flush");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pending (unflushed) event count, for tests and monitoring.
    pub async fn pending(&self) -> usize {
        self.buffers.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for BatchingEventStore {
    async fn append(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        let (aggregate, expected) = validate_batch(&events)?;
        let ready: Option<Vec<EventEnvelope>> = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(aggregate.clone()).or_default();
            // A buffered tail must stay dense with the incoming batch.
            if let Some(last) = buffer.last() {
                if last.version != expected {
                    return Err(EventError::InvalidBatch {
                        message: format!(
                            "buffered tail for {} ends at version {}, incoming batch expects {}",
                            aggregate, last.version, expected
                        ),
                    });
                }
            }
            buffer.extend(events);
            if buffer.len() >= self.config.batch_size {
                Some(buffers.remove(&aggregate).unwrap_or_default())
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.inner.append(batch).await?;
        }
        Ok(())
    }

    async fn events_for(
        &self,
        aggregate_kind: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        self.flush_all().await?;
        self.inner.events_for(aggregate_kind, aggregate_id, from_version).await
    }

    async fn events_by_kind(
        &self,
        event_kind: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> EventResult<Vec<EventEnvelope>> {
        self.flush_all().await?;
        self.inner.events_by_kind(event_kind, from, limit).await
    }

    async fn events_for_aggregates(
        &self,
        aggregate_kind: &str,
        aggregate_ids: &[String],
        from_version: i64,
    ) -> EventResult<Vec<EventEnvelope>> {
        self.flush_all().await?;
        self.inner
            .events_for_aggregates(aggregate_kind, aggregate_ids, from_version)
            .await
    }

    async fn all_events(&self, from: DateTime<Utc>, limit: usize) -> EventResult<Vec<EventEnvelope>> {
        self.flush_all().await?;
        self.inner.all_events(from, limit).await
    }

    async fn latest_version(&self, aggregate_kind: &str, aggregate_id: &str) -> EventResult<i64> {
        self.flush_all().await?;
        self.inner.latest_version(aggregate_kind, aggregate_id).await
    }

    async fn close(&self) -> EventResult<()> {
        self.shutdown.cancel();
        self.flush_all().await?;
        self.inner.close().await
    }
}
