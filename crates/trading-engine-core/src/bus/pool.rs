// File: src/bus/pool.rs
//
// Asynchronous delivery over a bounded worker pool. Each worker owns a
// bounded queue; a partition function routes events so one aggregate
// always lands on one worker when ordered delivery is required.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{EventError, EventResult};
use crate::event::EventEnvelope;

use super::{EventBus, EventSubscriber, SubscriptionFilter, SubscriptionId, SubscriptionTable};

/// Partition routing for the pool.
#[derive(Clone)]
pub enum PartitionKey {
    /// Route by aggregate id: per-aggregate delivery order holds.
    AggregateId,
    /// Route by event kind.
    EventKind,
    /// Custom routing function.
    Custom(Arc<dyn Fn(&EventEnvelope) -> String + Send + Sync>),
}

impl std::fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKey::AggregateId => write!(f, "AggregateId"),
            PartitionKey::EventKind => write!(f, "EventKind"),
            PartitionKey::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Configuration for the worker-pool bus.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Per-worker queue capacity. A full queue drops the fan-out with a
    /// warning; the durable append has already happened upstream.
    pub queue_capacity: usize,
    pub partition: PartitionKey,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            partition: PartitionKey::AggregateId,
        }
    }
}

type WorkItem = (EventEnvelope, Vec<Arc<dyn EventSubscriber>>);

/// Quiesce marker: signals once a worker has drained everything queued
/// ahead of it.
struct Barrier {
    signal: tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

#[async_trait]
impl EventSubscriber for Barrier {
    async fn on_event(&self, _event: &EventEnvelope) -> EventResult<()> {
        if let Some(tx) = self.signal.lock().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "barrier"
    }
}

/// Bounded worker-pool event bus. `publish` enqueues and returns;
/// workers drain their queues and invoke subscribers sequentially, so
/// per-aggregate order is preserved whenever the partition key pins an
/// aggregate to one worker (or `workers == 1`).
pub struct WorkerPoolEventBus {
    subscriptions: Arc<SubscriptionTable>,
    senders: Vec<mpsc::Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    partition: PartitionKey,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl WorkerPoolEventBus {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let workers_count = config.workers.max(1);
        let shutdown = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let mut senders = Vec::with_capacity(workers_count);
        let mut workers = Vec::with_capacity(workers_count);

        for worker_index in 0..workers_count {
            let (tx, mut rx) = mpsc::channel::<WorkItem>(config.queue_capacity.max(1));
            senders.push(tx);
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        item = rx.recv() => {
                            let Some((event, subscribers)) = item else { break };
                            for subscriber in subscribers {
                                if let Err(e) = subscriber.on_event(&event).await {
                                    error!(
                                        worker = worker_index,
                                        subscriber = subscriber.name(),
                                        event_id = %event.event_id,
                                        error = %e,
                                        "subscriber failed"
                                    );
                                }
                            }
                        }
                        _ = token.cancelled() => {
                            // Drain whatever is already queued, then stop.
                            while let Ok((event, subscribers)) = rx.try_recv() {
                                for subscriber in subscribers {
                                    if let Err(e) = subscriber.on_event(&event).await {
                                        error!(
                                            worker = worker_index,
                                            subscriber = subscriber.name(),
                                            event_id = %event.event_id,
                                            error = %e,
                                            "subscriber failed during drain"
                                        );
                                    }
                                }
                            }
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            subscriptions: Arc::new(SubscriptionTable::new()),
            senders,
            workers,
            partition: config.partition,
            dropped,
            shutdown,
        }
    }

    fn worker_for(&self, event: &EventEnvelope) -> usize {
        let key = match &self.partition {
            PartitionKey::AggregateId => event.aggregate_id.clone(),
            PartitionKey::EventKind => event.event_kind.clone(),
            PartitionKey::Custom(f) => f(event),
        };
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Fan-outs dropped because a worker queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signal shutdown and wait for workers to drain their queues.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    /// Wait until every event queued so far has been handled, by
    /// pushing a barrier through each worker queue. Test and shutdown
    /// aid; publishes racing with this call may stay queued.
    pub async fn quiesce(&self) {
        for sender in &self.senders {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let barrier: Arc<dyn EventSubscriber> = Arc::new(Barrier {
                signal: tokio::sync::Mutex::new(Some(tx)),
            });
            let marker = EventEnvelope::new("__barrier", "-", "__barrier", 1, serde_json::Value::Null);
            if sender.send((marker, vec![barrier])).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
}

#[async_trait]
impl EventBus for WorkerPoolEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(EventError::ShuttingDown {
                message: "worker pool is stopping".to_string(),
            });
        }
        let subscribers = self.subscriptions.matching(&event).await;
        if subscribers.is_empty() {
            return Ok(());
        }
        let index = self.worker_for(&event);
        match self.senders[index].try_send((event, subscribers)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full((event, _))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = index,
                    event_id = %event.event_id,
                    event_kind = %event.event_kind,
                    "worker queue full, dropping fan-out (event is durable)"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EventError::ShuttingDown {
                message: "worker pool is stopping".to_string(),
            }),
        }
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        Ok(self.subscriptions.insert(SubscriptionFilter::All, subscriber).await)
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        Ok(self
            .subscriptions
            .insert(SubscriptionFilter::EventKind(event_kind.to_string()), subscriber)
            .await)
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        Ok(self
            .subscriptions
            .insert(
                SubscriptionFilter::AggregateKind(aggregate_kind.to_string()),
                subscriber,
            )
            .await)
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        self.subscriptions.remove(subscription_id).await;
        Ok(())
    }
}
