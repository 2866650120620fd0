// File: src/bus/sourced.rs
//
// The durable front door: append to the event store, then broadcast.
// Subscribers never observe an event that is not in the store.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::EventResult;
use crate::event::EventEnvelope;
use crate::store::EventStore;

use super::{EventBus, EventSubscriber, SubscriptionId};

/// Composes an [`EventStore`] with a delivery bus. `publish` appends
/// first and only broadcasts after the durable write returns success;
/// `publish_batch` persists the whole batch in a single atomic append
/// and then fans each event out in order.
///
/// A failed append leaves no trace and nothing is delivered. A failure
/// after the append (delivery) is the inner bus's log-and-continue
/// problem; the durable event remains authoritative.
pub struct EventSourcedBus {
    store: Arc<dyn EventStore>,
    inner: Arc<dyn EventBus>,
}

impl EventSourcedBus {
    pub fn new(store: Arc<dyn EventStore>, inner: Arc<dyn EventBus>) -> Self {
        Self { store, inner }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn delivery(&self) -> &Arc<dyn EventBus> {
        &self.inner
    }
}

#[async_trait]
impl EventBus for EventSourcedBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        self.store.append(vec![event.clone()]).await?;
        self.inner.publish(event).await
    }

    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.store.append(events.clone()).await?;
        for event in events {
            self.inner.publish(event).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        self.inner.subscribe(subscriber).await
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner.subscribe_to_kind(event_kind, subscriber).await
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner.subscribe_to_aggregate_kind(aggregate_kind, subscriber).await
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        self.inner.unsubscribe(subscription_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_support::RecordingSubscriber;
    use crate::bus::SyncEventBus;
    use crate::error::EventError;
    use crate::store::InMemoryEventStore;
    use serde_json::json;

    fn deposit(id: &str, version: i64) -> EventEnvelope {
        EventEnvelope::new("account", id, "funds_deposited", version, json!({}))
    }

    fn sourced() -> (Arc<InMemoryEventStore>, EventSourcedBus) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = EventSourcedBus::new(store.clone(), Arc::new(SyncEventBus::new()));
        (store, bus)
    }

    #[tokio::test]
    async fn event_is_stored_before_subscribers_observe_it() {
        let (store, bus) = sourced();

        // The subscriber checks the store at delivery time.
        struct StoreChecker {
            store: Arc<InMemoryEventStore>,
        }
        #[async_trait]
        impl EventSubscriber for StoreChecker {
            async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
                let stored = self
                    .store
                    .events_for(&event.aggregate_kind, &event.aggregate_id, 0)
                    .await?;
                assert!(stored.iter().any(|e| e.event_id == event.event_id));
                Ok(())
            }
            fn name(&self) -> &str {
                "store_checker"
            }
        }

        bus.subscribe(Arc::new(StoreChecker { store: store.clone() }))
            .await
            .unwrap();
        bus.publish(deposit("A1", 1)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn failed_append_delivers_nothing() {
        let (store, bus) = sourced();
        store.append(vec![deposit("A1", 1)]).await.unwrap();

        let sub = RecordingSubscriber::new("silent");
        bus.subscribe(sub.clone()).await.unwrap();

        let err = bus.publish(deposit("A1", 1)).await.unwrap_err();
        assert!(matches!(err, EventError::ConcurrencyConflict { .. }));
        assert_eq!(sub.count(), 0);
    }

    #[tokio::test]
    async fn batch_is_appended_atomically_then_fanned_out() {
        let (store, bus) = sourced();
        let sub = RecordingSubscriber::new("batch");
        bus.subscribe(sub.clone()).await.unwrap();

        bus.publish_batch(vec![deposit("A1", 1), deposit("A1", 2)])
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(sub.versions(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (store, bus) = sourced();
        bus.publish_batch(Vec::new()).await.unwrap();
        assert!(store.is_empty().await);
    }
}
