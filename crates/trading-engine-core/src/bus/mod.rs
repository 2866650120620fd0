// File: src/bus/mod.rs
//
// Event bus contract: publish/subscribe with all, event-kind, and
// aggregate-kind scoped subscriptions

pub mod pool;
pub mod sourced;
pub mod sync;

pub use pool::{PartitionKey, WorkerPoolConfig, WorkerPoolEventBus};
pub use sourced::EventSourcedBus;
pub use sync::SyncEventBus;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EventResult;
use crate::event::EventEnvelope;

/// Identifier handed back by `subscribe`, used to unsubscribe.
pub type SubscriptionId = Uuid;

/// Subscriber callback. Implementations must tolerate being called from
/// any task; failures are logged by the bus and never propagate to the
/// publisher.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &EventEnvelope) -> EventResult<()>;

    /// Name used in logs when the subscriber fails.
    fn name(&self) -> &str;
}

/// The three subscription scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    EventKind(String),
    AggregateKind(String),
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::EventKind(kind) => event.event_kind == *kind,
            SubscriptionFilter::AggregateKind(kind) => event.aggregate_kind == *kind,
        }
    }
}

/// Publish/subscribe contract shared by every delivery substrate:
/// in-process buses, transport adapters, and the decorators that wrap
/// them.
///
/// Delivery semantics (ordering, queuing) are the implementation's;
/// durability belongs to [`EventSourcedBus`], which appends to the event
/// store before delegating. Handler failures never propagate to the
/// publisher.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()>;

    /// Publish a batch; with [`EventSourcedBus`] on top the whole batch
    /// is persisted in one atomic append before any fan-out.
    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Subscribe to all events.
    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId>;

    /// Subscribe to one event kind.
    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId>;

    /// Subscribe to every event of one aggregate kind.
    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId>;

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()>;
}

/// Registration-ordered subscription table shared by the in-process
/// buses. Publish paths snapshot the matching subscribers under the
/// read lock and drop it before any subscriber runs.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<Vec<SubscriptionEntry>>,
}

struct SubscriptionEntry {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    subscriber: Arc<dyn EventSubscriber>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        filter: SubscriptionFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.entries.write().await.push(SubscriptionEntry {
            id,
            filter,
            subscriber,
        });
        id
    }

    pub async fn remove(&self, id: SubscriptionId) {
        self.entries.write().await.retain(|entry| entry.id != id);
    }

    /// Matching subscribers in registration order, cloned out so no
    /// lock is held across their invocation.
    pub async fn matching(&self, event: &EventEnvelope) -> Vec<Arc<dyn EventSubscriber>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.filter.matches(event))
            .map(|entry| entry.subscriber.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_match_their_scope() {
        let event = EventEnvelope::new("account", "A1", "funds_deposited", 1, json!({}));
        assert!(SubscriptionFilter::All.matches(&event));
        assert!(SubscriptionFilter::EventKind("funds_deposited".to_string()).matches(&event));
        assert!(!SubscriptionFilter::EventKind("account_opened".to_string()).matches(&event));
        assert!(SubscriptionFilter::AggregateKind("account".to_string()).matches(&event));
        assert!(!SubscriptionFilter::AggregateKind("order".to_string()).matches(&event));
    }

    #[tokio::test]
    async fn table_preserves_registration_order() {
        let table = SubscriptionTable::new();
        let first = test_support::RecordingSubscriber::new("first");
        let second = test_support::RecordingSubscriber::new("second");
        table.insert(SubscriptionFilter::All, first).await;
        table.insert(SubscriptionFilter::All, second).await;

        let event = EventEnvelope::new("account", "A1", "funds_deposited", 1, json!({}));
        let matched = table.matching(&event).await;
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].name(), "first");
        assert_eq!(matched[1].name(), "second");
    }

    #[tokio::test]
    async fn remove_drops_the_subscription() {
        let table = SubscriptionTable::new();
        let sub = test_support::RecordingSubscriber::new("one");
        let id = table.insert(SubscriptionFilter::All, sub).await;
        assert_eq!(table.len().await, 1);
        table.remove(id).await;
        assert!(table.is_empty().await);
    }
}
