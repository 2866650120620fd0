// File: src/ordering.rs
//
// Advisory ordering validation: watermarks per aggregate, per event
// kind, or global. Violations are counted and logged; the event is
// published regardless, so a reordering substrate cannot stall the
// pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionId};
use trading_engine_core::config::OrderingGuarantee;
use trading_engine_core::error::EventResult;
use trading_engine_core::event::{AggregateRef, EventEnvelope};

#[derive(Default)]
struct Watermarks {
    per_aggregate: HashMap<AggregateRef, i64>,
    per_kind: HashMap<String, i64>,
    global: i64,
}

/// Bus decorator checking that versions only move forward at the
/// configured guarantee level. With `OrderingGuarantee::None` it is a
/// pure pass-through.
pub struct OrderingValidator {
    inner: Arc<dyn EventBus>,
    guarantee: OrderingGuarantee,
    watermarks: RwLock<Watermarks>,
    violations: AtomicU64,
}

impl OrderingValidator {
    pub fn new(inner: Arc<dyn EventBus>, guarantee: OrderingGuarantee) -> Self {
        Self {
            inner,
            guarantee,
            watermarks: RwLock::new(Watermarks::default()),
            violations: AtomicU64::new(0),
        }
    }

    /// Number of ordering violations observed so far.
    pub fn violations(&self) -> u64 {
        self.violations.load(AtomicOrdering::Relaxed)
    }

    /// Swap the guarantee level at runtime.
    pub fn set_guarantee(&mut self, guarantee: OrderingGuarantee) {
        self.guarantee = guarantee;
    }

    async fn validate(&self, event: &EventEnvelope) {
        if self.guarantee == OrderingGuarantee::None {
            return;
        }
        let mut marks = self.watermarks.write().await;
        let (last, scope): (&mut i64, String) = match self.guarantee {
            OrderingGuarantee::Aggregate => {
                let aggregate = event.aggregate_ref();
                let scope = aggregate.to_string();
                (marks.per_aggregate.entry(aggregate).or_insert(0), scope)
            }
            OrderingGuarantee::Kind => (
                marks.per_kind.entry(event.event_kind.clone()).or_insert(0),
                event.event_kind.clone(),
            ),
            OrderingGuarantee::Global => (&mut marks.global, "global".to_string()),
            OrderingGuarantee::None => unreachable!(),
        };
        if event.version <= *last {
            self.violations.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                scope = %scope,
                version = event.version,
                watermark = *last,
                event_id = %event.event_id,
                "ordering violation (advisory), event still published"
            );
        } else {
            *last = event.version;
        }
    }
}

#[async_trait]
impl EventBus for OrderingValidator {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        self.validate(&event).await;
        self.inner.publish(event).await
    }

    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        for event in &events {
            self.validate(event).await;
        }
        self.inner.publish_batch(events).await
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
