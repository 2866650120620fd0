// File: src/projection.rs
//
// Read-model projections: per-event-kind handler tables, live updates,
// and rebuild by global replay

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::bus::EventSubscriber;
use crate::error::{EventError, EventResult};
use crate::event::EventEnvelope;
use crate::store::EventStore;

/// A named read model. State is interior-mutable so one instance can be
/// shared between the live bus path and the rebuild path. After
/// replaying all events whose kinds it handles, the state is a pure
/// function of that event sequence.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Event kinds this projection handles. Anything else is a no-op.
    fn handled_kinds(&self) -> Vec<String>;

    async fn apply(&self, event: &EventEnvelope) -> EventResult<()>;

    /// Clear all state.
    async fn reset(&self) -> EventResult<()>;

    fn handles(&self, event: &EventEnvelope) -> bool {
        self.handled_kinds().iter().any(|kind| *kind == event.event_kind)
    }
}

/// Owns the registered projections in registration order.
pub struct ProjectionManager {
    store: Arc<dyn EventStore>,
    projections: RwLock<Vec<Arc<dyn Projection>>>,
}

impl ProjectionManager {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            projections: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, projection: Arc<dyn Projection>) -> EventResult<()> {
        let mut projections = self.projections.write().await;
        if projections.iter().any(|p| p.name() == projection.name()) {
            return Err(EventError::AlreadyRegistered {
                name: projection.name().to_string(),
            });
        }
        projections.push(projection);
        Ok(())
    }

    async fn find(&self, name: &str) -> EventResult<Arc<dyn Projection>> {
        self.projections
            .read()
            .await
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| EventError::HandlerError {
                message: format!("projection '{}' not registered", name),
            })
    }

    /// Live path: hand the event to every projection that subscribes to
    /// its kind. A projection error is logged and does not abort the
    /// others.
    pub async fn handle(&self, event: &EventEnvelope) {
        let projections = self.projections.read().await.clone();
        for projection in projections {
            if !projection.handles(event) {
                continue;
            }
            if let Err(e) = projection.apply(event).await {
                error!(
                    projection = projection.name(),
                    event_id = %event.event_id,
                    event_kind = %event.event_kind,
                    error = %e,
                    "projection failed to apply event"
                );
            }
        }
    }

    pub async fn reset(&self, name: &str) -> EventResult<()> {
        self.find(name).await?.reset().await
    }

    /// Reset, then stream the whole log through the projection in
    /// commit order. Unlike the live path, an apply error aborts the
    /// rebuild.
    pub async fn rebuild(&self, name: &str) -> EventResult<()> {
        let projection = self.find(name).await?;
        projection.reset().await?;
        let events = self.store.all_events(DateTime::<Utc>::MIN_UTC, 0).await?;
        let total = events.len();
        for event in &events {
            if projection.handles(event) {
                projection.apply(event).await?;
            }
        }
        info!(projection = name, scanned = total, "projection rebuilt");
        Ok(())
    }

    /// Reset every projection, then run a single global scan handing
    /// each event to every projection in registration order.
    pub async fn rebuild_all(&self) -> EventResult<()> {
        let projections = self.projections.read().await.clone();
        for projection in &projections {
            projection.reset().await?;
        }
        let events = self.store.all_events(DateTime::<Utc>::MIN_UTC, 0).await?;
        for event in &events {
            for projection in &projections {
                if projection.handles(event) {
                    projection.apply(event).await?;
                }
            }
        }
        info!(
            projections = projections.len(),
            scanned = events.len(),
            "all projections rebuilt"
        );
        Ok(())
    }

    pub async fn names(&self) -> Vec<String> {
        self.projections
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

/// Adapter that plugs a [`ProjectionManager`] into any event bus as a
/// subscriber, driving the live `handle` path.
pub struct ProjectionSubscriber {
    manager: Arc<ProjectionManager>,
}

impl ProjectionSubscriber {
    pub fn new(manager: Arc<ProjectionManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

#[async_trait]
impl EventSubscriber for ProjectionSubscriber {
    async fn on_event(&self, event: &EventEnvelope) -> EventResult<()> {
        self.manager.handle(event).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "projections"
    }
}
