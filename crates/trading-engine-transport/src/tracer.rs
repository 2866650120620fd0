// File: src/tracer.rs
//
// Tracing decorator: a span per publish and per handled event, sampled
// 1-in-N. Trace and span ids ride the event metadata so remote
// subscribers join the originating trace.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionId};
use trading_engine_core::error::EventResult;
use trading_engine_core::event::EventEnvelope;

/// Bus decorator creating spans around publish and subscriber handling.
/// Sampling is deterministic 1-in-N by publish count; unsampled events
/// pass through untouched.
pub struct TracingEventBus {
    inner: Arc<dyn EventBus>,
    sampling_rate: u64,
    publishes: AtomicU64,
}

impl TracingEventBus {
    pub fn new(inner: Arc<dyn EventBus>, sampling_rate: u64) -> Self {
        Self {
            inner,
            sampling_rate: sampling_rate.max(1),
            publishes: AtomicU64::new(0),
        }
    }

    fn sampled(&self) -> bool {
        self.publishes.fetch_add(1, Ordering::Relaxed) % self.sampling_rate == 0
    }

    fn stamp(&self, mut event: EventEnvelope) -> EventEnvelope {
        if event.metadata.trace_id.is_none() {
            event.metadata.trace_id = Some(Uuid::new_v4().simple().to_string());
        }
        event.metadata.span_id = Some(Uuid::new_v4().simple().to_string()[..16].to_string());
        event
    }
}

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        if !self.sampled() {
            return self.inner.publish(event).await;
        }
        let event = self.stamp(event);
        let span = tracing::info_span!(
            "event_publish",
            event_id = %event.event_id,
            event_kind = %event.event_kind,
            aggregate = %event.aggregate_ref(),
            version = event.version,
            trace_id = event.metadata.trace_id.as_deref().unwrap_or(""),
            span_id = event.metadata.span_id.as_deref().unwrap_or(""),
        );
        self.inner.publish(event).instrument(span).await
    }

    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        if !self.sampled() {
            return self.inner.publish_batch(events).await;
        }
        let events: Vec<EventEnvelope> = events.into_iter().map(|e| self.stamp(e)).collect();
        let span = tracing::info_span!("event_publish_batch", events = events.len());
        self.inner.publish_batch(events).instrument(span).await
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        self.inner.subscribe(TracedSubscriber::wrap(subscriber)).await
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner
            .subscribe_to_kind(event_kind, TracedSubscriber::wrap(subscriber))
            .await
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.inner
            .subscribe_to_aggregate_kind(aggregate_kind, TracedSubscriber::wrap(subscriber))
            .await
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        self.inner.unsubscribe(subscription_id).await
    }
}

/// Wraps a subscriber so handling joins the trace carried in the event
/// metadata. Untraced events are handled without a span.
struct TracedSubscriber {
    inner: Arc<dyn EventSubscriber>,
}

impl TracedSubscriber {
    fn wrap(inner: Arc<dyn EventSubscriber>) -> Arc<dyn EventSubscriber> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl EventSubscriber for TracedSubscriber {
    async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
        let Some(trace_id) = event.metadata.trace_id.as_deref() else {
            return self.inner.on_event(event).await;
        };
        let span = tracing::info_span!(
            "event_handle",
            subscriber = self.inner.name(),
            event_id = %event.event_id,
            event_kind = %event.event_kind,
            trace_id,
            parent_span_id = event.metadata.span_id.as_deref().unwrap_or(""),
        );
        self.inner.on_event(event).instrument(span).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct CapturingBus {
        published: Mutex<Vec<EventEnvelope>>,
    }

    impl CapturingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventBus for CapturingBus {
        async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
            self.published.lock().unwrap().push(event);
            Ok(())
        }

        async fn subscribe(&self, _s: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
            Ok(uuid::Uuid::new_v4())
        }

        async fn subscribe_to_kind(
            &self,
            _k: &str,
            _s: Arc<dyn EventSubscriber>,
        ) -> EventResult<SubscriptionId> {
            Ok(uuid::Uuid::new_v4())
        }

        async fn subscribe_to_aggregate_kind(
            &self,
            _k: &str,
            _s: Arc<dyn EventSubscriber>,
        ) -> EventResult<SubscriptionId> {
            Ok(uuid::Uuid::new_v4())
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> EventResult<()> {
            Ok(())
        }
    }

    fn deposit(version: i64) -> EventEnvelope {
        EventEnvelope::new("account", "A1", "funds_deposited", version, json!({}))
    }

    #[tokio::test]
    async fn sampled_publish_stamps_trace_ids() {
        let inner = CapturingBus::new();
        let tracer = TracingEventBus::new(inner.clone(), 1);

        tracer.publish(deposit(1)).await.unwrap();

        let published = inner.published.lock().unwrap();
        assert!(published[0].metadata.trace_id.is_some());
        assert!(published[0].metadata.span_id.is_some());
    }

    #[tokio::test]
    async fn one_in_n_sampling_is_deterministic() {
        let inner = CapturingBus::new();
        let tracer = TracingEventBus::new(inner.clone(), 4);

        for version in 1..=8 {
            tracer.publish(deposit(version)).await.unwrap();
        }

        let published = inner.published.lock().unwrap();
        let traced = published
            .iter()
            .filter(|e| e.metadata.trace_id.is_some())
            .count();
        assert_eq!(traced, 2);
    }

    #[tokio::test]
    async fn existing_trace_id_is_preserved() {
        let inner = CapturingBus::new();
        let tracer = TracingEventBus::new(inner.clone(), 1);

        let mut event = deposit(1);
        event.metadata.trace_id = Some("upstream-trace".to_string());
        tracer.publish(event).await.unwrap();

        let published = inner.published.lock().unwrap();
        assert_eq!(
            published[0].metadata.trace_id.as_deref(),
            Some("upstream-trace")
        );
    }
}
