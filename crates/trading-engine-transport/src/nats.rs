// File: src/nats.rs
//
// NATS message-broker adapter: publishes encoded events on derived
// subjects, subscribes raw or via queue groups, logs connection state
// transitions, and drains in-flight deliveries on stop

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionFilter, SubscriptionId};
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::EventEnvelope;

use crate::codec::{decode_event, encode_event};
use crate::subject::SubjectScheme;

/// Configuration for the broker adapter.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub endpoints: Vec<String>,
    pub scheme: SubjectScheme,
    /// Bound on the drain performed by `stop`.
    pub drain_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["nats://localhost:4222".to_string()],
            scheme: SubjectScheme::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Event bus over core NATS subjects. Delivery-only: durability is the
/// event-sourced bus's concern upstream, so a `TransportError` here
/// always refers to an event that is already persisted.
pub struct NatsEventBus {
    client: async_nats::Client,
    config: NatsConfig,
    tasks: RwLock<HashMap<SubscriptionId, Vec<JoinHandle<()>>>>,
}

impl NatsEventBus {
    /// Connect, logging connection state transitions (reconnects,
    /// disconnects, slow consumers) as they happen.
    pub async fn connect(config: NatsConfig) -> EventResult<Self> {
        let addrs = config.endpoints.join(",");
        let client = async_nats::ConnectOptions::new()
            .event_callback(|event| async move {
                info!(state = %event, "nats connection event");
            })
            .connect(addrs.as_str())
            .await
            .map_err(|e| EventError::TransportError {
                message: format!("nats connect to {} failed: {}", addrs, e),
            })?;
        info!(endpoints = %addrs, "nats adapter connected");
        Ok(Self {
            client,
            config,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Adopt an existing client (shared connections, tests).
    pub fn with_client(client: async_nats::Client, config: NatsConfig) -> Self {
        Self {
            client,
            config,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    fn spawn_consumer(
        mut subscriber_stream: async_nats::Subscriber,
        subscriber: Arc<dyn EventSubscriber>,
        filter: SubscriptionFilter,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = subscriber_stream.next().await {
                let event = match decode_event(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        // Malformed frame: drop it, keep the subscription.
                        error!(subject = %message.subject, error = %e, "dropping undecodable event");
                        continue;
                    }
                };
                if !filter.matches(&event) {
                    continue;
                }
                if let Err(e) = subscriber.on_event(&event).await {
                    error!(
                        subscriber = subscriber.name(),
                        event_id = %event.event_id,
                        error = %e,
                        "subscriber failed; subscription continues"
                    );
                }
            }
        })
    }

    async fn subscribe_subjects(
        &self,
        subjects: Vec<String>,
        queue_group: Option<String>,
        subscriber: Arc<dyn EventSubscriber>,
        filter: SubscriptionFilter,
    ) -> EventResult<SubscriptionId> {
        let id = uuid::Uuid::new_v4();
        let mut handles = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let stream = match &queue_group {
                Some(group) => self
                    .client
                    .queue_subscribe(subject.clone(), group.clone())
                    .await,
                None => self.client.subscribe(subject.clone()).await,
            }
            .map_err(|e| EventError::TransportError {
                message: format!("subscribe to {} failed: {}", subject, e),
            })?;
            handles.push(Self::spawn_consumer(stream, subscriber.clone(), filter.clone()));
        }
        self.tasks.write().await.insert(id, handles);
        Ok(id)
    }

    /// Queue-group subscription to one event kind: each event reaches
    /// exactly one member of the group, for load-balanced handlers.
    pub async fn subscribe_to_kind_in_group(
        &self,
        event_kind: &str,
        queue_group: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.subscribe_subjects(
            self.config.scheme.kind_wildcards(event_kind),
            Some(queue_group.to_string()),
            subscriber,
            SubscriptionFilter::EventKind(event_kind.to_string()),
        )
        .await
    }

    /// Drain in-flight deliveries within the configured bound, then
    /// stop the consumer tasks.
    pub async fn stop(&self) -> EventResult<()> {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "flush before drain failed");
        }
        let drain = self.client.drain();
        if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
            warn!(
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "drain timed out, aborting in-flight deliveries"
            );
        }
        let mut tasks = self.tasks.write().await;
        for (_, handles) in tasks.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        info!("nats adapter stopped");
        Ok(())
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        let subject = self.config.scheme.subject_for(&event);
        let payload = encode_event(&event)?;
        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| EventError::TransportError {
                message: format!("publish to {} failed: {}", subject, e),
            })
    }

    async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> EventResult<SubscriptionId> {
        self.subscribe_subjects(
            vec![self.config.scheme.all_wildcard()],
            None,
            subscriber,
            SubscriptionFilter::All,
        )
        .await
    }

    async fn subscribe_to_kind(
        &self,
        event_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        self.subscribe_subjects(
            self.config.scheme.kind_wildcards(event_kind),
            None,
            subscriber,
            SubscriptionFilter::EventKind(event_kind.to_string()),
        )
        .await
    }

    async fn subscribe_to_aggregate_kind(
        &self,
        aggregate_kind: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> EventResult<SubscriptionId> {
        // Subjects carry event kinds, not aggregate kinds: take the
        // firehose and filter after decoding.
        self.subscribe_subjects(
            vec![self.config.scheme.all_wildcard()],
            None,
            subscriber,
            SubscriptionFilter::AggregateKind(aggregate_kind.to_string()),
        )
        .await
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> EventResult<()> {
        if let Some(handles) = self.tasks.write().await.remove(&subscription_id) {
            for handle in handles {
                handle.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Sink {
        seen: Mutex<Vec<EventEnvelope>>,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSubscriber for Sink {
        async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "sink"
        }
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server at localhost:4222"]
    async fn publish_reaches_kind_subscription() {
        let bus = NatsEventBus::connect(NatsConfig::default()).await.unwrap();
        let sink = Sink::new();
        bus.subscribe_to_kind("funds_deposited", sink.clone()).await.unwrap();

        let event = EventEnvelope::new("account", "A1", "funds_deposited", 1, json!({"amount": 50}));
        bus.publish(event.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_id, event.event_id);
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server at localhost:4222"]
    async fn queue_group_delivers_to_one_member() {
        let bus = NatsEventBus::connect(NatsConfig::default()).await.unwrap();
        let first = Sink::new();
        let second = Sink::new();
        bus.subscribe_to_kind_in_group("funds_deposited", "handlers", first.clone())
            .await
            .unwrap();
        bus.subscribe_to_kind_in_group("funds_deposited", "handlers", second.clone())
            .await
            .unwrap();

        for version in 1..=10 {
            let event = EventEnvelope::new("account", "A1", "funds_deposited", version, json!({}));
            bus.publish(event).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let total = first.seen.lock().unwrap().len() + second.seen.lock().unwrap().len();
        assert_eq!(total, 10);
    }
}
