// File: src/bus/sync.rs
//
// Synchronous in-process delivery: subscribers run sequentially in
// registration order and publish returns when all have completed

use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

use crate::error::EventResult;
use crate::event::EventEnvelope;

use super::{EventBus, EventSubscriber, SubscriptionFilter, SubscriptionId, SubscriptionTable};

/// The default delivery mode. A single publisher gets per-aggregate
/// order at every subscriber for free; handler failures are logged and
/// do not block later subscribers.
#[derive(Default)]
pub struct SyncEventBus {
    subscriptions: SubscriptionTable,
}

impl SyncEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for SyncEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        let subscribers = self.subscriptions.matching(&event).await;
        for subscriber in subscribers {
            if let Err(e) = subscriber.on_event(&event).await {
                error!(
                    subscriber = subscriber.name(),
                    event_id = %event.event_id,
                    event_kind = %event.event_kind,
                    error = %e,
                    "subscriber failed"
                );
            }
        }
        Ok(())
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
