// File: src/memory.rs
//
// In-process channel adapter: per-topic broadcast fan-out with
// configurable buffering, for single-process deployments

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionFilter, SubscriptionId};
use trading_engine_core::error::EventResult;
use trading_engine_core::event::EventEnvelope;

use crate::subject::SubjectScheme;

/// Per-topic pub/sub over `tokio::sync::broadcast` channels. Every
/// event lands on its concrete subject topic and on the firehose topic;
/// scoped subscriptions drain the firehose and filter, so sharded
/// subjects never hide events from kind subscribers.
///
/// A lagging subscriber loses the overwritten events (the durable copy
/// lives in the store); the loss is logged.
pub struct InMemoryTransport {
    scheme: SubjectScheme,
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    tasks: RwLock<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl InMemoryTransport {
    pub fn new(scheme: SubjectScheme, capacity: usize) -> Self {
        Self {
            scheme,
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<EventEnvelope> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Raw per-topic subscription, bypassing the event-bus scoping.
    pub async fn subscribe_subject(&self, subject: &str) -> broadcast::Receiver<EventEnvelope> {
        self.sender_for(subject).await.subscribe()
    }

    fn spawn_drainer(
        subscriber: Arc<dyn EventSubscriber>,
        mut receiver: broadcast::Receiver<EventEnvelope>,
        filter: SubscriptionFilter,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        if let Err(e) = subscriber.on_event(&event).await {
                            error!(
                                subscriber = subscriber.name(),
                                event_id = %event.event_id,
                                error = %e,
                                "subscriber failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            subscriber = subscriber.name(),
                            missed,
                            "subscriber lagged, events dropped from fan-out"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn subscribe_filtered(
        &self,
        subscriber: Arc<dyn EventSubscriber>,
        filter: SubscriptionFilter,
    ) -> SubscriptionId {
        let id = uuid::Uuid::new_v4();
        let receiver = self.sender_for(&self.scheme.all_wildcard()).await.subscribe();
        let handle = Self::spawn_drainer(subscriber, receiver, filter);
        self.tasks.write().await.insert(id, handle);
        id
    }
}

#[async_trait]
impl EventBus for InMemoryTransport {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        // A send error only means nobody is listening on that topic.
        let subject = self.scheme.subject_for(&event);
        let _ = self.sender_for(&subject).await.send(event.clone());
        let _ = self.sender_for(&self.scheme.all_wildcard()).await.send(event);
        Ok(())
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        Ok(self.subscribe_filtered(subscriber, SubscriptionFilter::All).await)
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        Ok(self
            .subscribe_filtered(subscriber, SubscriptionFilter::EventKind(event_kind.to_string()))
            .await)
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        Ok(self
            .subscribe_filtered(
                subscriber,
                SubscriptionFilter::AggregateKind(aggregate_kind.to_string()),
            )
            .await)
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        if let Some(handle) = self.tasks.write().await.remove(&subscription_id) {
            handle.abort();
        }
        Ok(())
    }
}
