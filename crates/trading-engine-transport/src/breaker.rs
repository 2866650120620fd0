// File: src/breaker.rs
//
// Circuit breaker around a bus's publish path. Subscribe paths bypass
// the breaker: cutting off consumers would not protect anything.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use trading_engine_core::bus::{EventBus, EventSubscriber, SubscriptionId};
use trading_engine_core::config::CircuitBreakerSettings;
use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::EventEnvelope;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Publishes are short-circuited
    Open,
    /// Probing whether the substrate recovered
    HalfOpen,
}

/// Breaker call counters.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub successful: u64,
    pub failed: u64,
    pub short_circuited: u64,
}

/// Configuration for the breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening. 0 disables the breaker: it
    /// never opens.
    pub failure_threshold: u32,
    /// Open-to-half-open delay measured from the last failure.
    pub reset_timeout: Duration,
    /// Successful probes required to close from half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

/// Bus decorator implementing the closed / open / half-open state
/// machine over the inner publish path.
pub struct CircuitBreakerBus {
    inner: Arc<dyn EventBus>,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    total_calls: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreakerBus {
    pub fn new(inner: Arc<dyn EventBus>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            total_calls: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    /// Current state, transitioning open→half-open when the reset
    /// timeout has elapsed since the last failure.
    pub async fn state(&self) -> CircuitState {
        let state = *self.state.read().await;
        if state == CircuitState::Open {
            let elapsed_enough = self
                .last_failure
                .lock()
                .map(|guard| {
                    guard
                        .map(|at| at.elapsed() >= self.config.reset_timeout)
                        .unwrap_or(true)
                })
                .unwrap_or(false);
            if elapsed_enough {
                self.transition(CircuitState::HalfOpen).await;
                return CircuitState::HalfOpen;
            }
        }
        state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
        }
    }

    async fn transition(&self, to: CircuitState) {
        let mut state = self.state.write().await;
        if *state == to {
            return;
        }
        info!(from = ?*state, to = ?to, "circuit breaker state changed");
        *state = to;
        match to {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.half_open_successes.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.half_open_successes.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    async fn on_success(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        let current = *self.state.read().await;
        match current {
            CircuitState::HalfOpen => {
                let probes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if probes >= self.config.half_open_max_calls {
                    self.transition(CircuitState::Closed).await;
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_failure.lock() {
            *guard = Some(Instant::now());
        }
        let current = *self.state.read().await;
        match current {
            CircuitState::HalfOpen => {
                // Any probe failure reopens immediately.
                self.transition(CircuitState::Open).await;
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if self.config.failure_threshold > 0 && failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open).await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn guarded_publish<F>(&self, publish: F) -> EventResult<()>
    where
        F: std::future::Future<Output = EventResult<()>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if self.state().await == CircuitState::Open {
            self.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(EventError::CircuitOpen);
        }
        match publish.await {
            Ok(()) => {
                self.on_success().await;
                Ok(())
            }
            Err(e) => {
                self.on_failure().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventBus for CircuitBreakerBus {
    async fn publish(&self, event: EventEnvelope) -> EventResult<()> {
        self.guarded_publish(self.inner.publish(event)).await
    }

    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> EventResult<()> {
        self.guarded_publish(self.inner.publish_batch(events)).await
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
